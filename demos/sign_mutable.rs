use clap::Parser;
use dhtstore::MutableItem;

#[derive(Parser)]
#[command(author, version, about = "Sign a mutable item and print its target", long_about = None)]
struct Cli {
    /// Hex encoded 32 bytes ed25519 seed, or 64 bytes keypair.
    secret_key: String,
    /// Value to sign.
    value: String,
    /// Sequence number.
    #[arg(short, long, default_value_t = 1)]
    seq: i64,
    /// Optional salt.
    #[arg(long)]
    salt: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let secret_key = from_hex(&cli.secret_key);

    let item = match MutableItem::sign(
        &secret_key,
        cli.value.as_bytes(),
        cli.seq,
        cli.salt.as_ref().map(|salt| salt.as_bytes()),
    ) {
        Ok(item) => item,
        Err(error) => {
            eprintln!("Error: {}", error);
            std::process::exit(1);
        }
    };

    println!("target:     {}", item.target());
    println!("public key: {}", to_hex(item.key()));
    println!("seq:        {}", item.seq());
    println!("cas:        {:?}", item.cas());
    println!("signature:  {}", to_hex(item.signature()));
}

fn from_hex(s: &str) -> Vec<u8> {
    if s.len() % 2 != 0 {
        panic!("Number of Hex characters should be even");
    }

    (0..s.len() / 2)
        .map(|i| u8::from_str_radix(&s[i * 2..(i * 2) + 2], 16).expect("Invalid hex character"))
        .collect()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}
