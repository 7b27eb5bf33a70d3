//! Ed25519 key generation tool for Haven nodes.
//!
//! Creates the node identity keypair: the 32-byte secret written to
//! `node_key.bin` (loaded at startup) and the public key / identity id for
//! operator records.
//!
//! Usage:
//!   cargo run --bin keygen -- --name "my-node" --output ./keys/

use clap::Parser;
use haven::crypto::Keypair;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keygen", version, about = "Haven Ed25519 key generator")]
struct Args {
    /// Node name (for file naming and documentation)
    #[arg(short, long)]
    name: String,

    /// Output directory for keys
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
}

fn main() {
    let args = Args::parse();

    println!("════════════════════════════════════════════════════════════");
    println!("  Haven Ed25519 Keypair Generator");
    println!("════════════════════════════════════════════════════════════");
    println!();
    println!("Generating keypair for: {}", args.name);
    println!();

    let keypair = Keypair::generate();

    fs::create_dir_all(&args.output).expect("Failed to create output directory");

    let secret_path = args.output.join(format!("{}_node_key.bin", args.name));
    fs::write(&secret_path, keypair.secret()).expect("Failed to write secret key");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&secret_path)
            .expect("Failed to stat secret key")
            .permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&secret_path, perms).expect("Failed to chmod secret key");
    }
    println!("Secret key saved to: {}", secret_path.display());

    let pubkey_path = args.output.join(format!("{}_public.key", args.name));
    fs::write(&pubkey_path, keypair.public()).expect("Failed to write public key");
    println!("Public key saved to: {}", pubkey_path.display());
    println!();

    println!("Public key:  {}", hex::encode(keypair.public()));
    println!("Identity id: {}", hex::encode(keypair.identity_id()));
    println!("Generated:   {}", chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));
    println!();

    // Verification test
    let test_message = b"haven node key self-test";
    let signature = keypair.sign(test_message);
    match haven::crypto::verify(&keypair.public(), test_message, &signature) {
        Ok(()) => println!("Signature self-test: PASSED"),
        Err(_) => {
            println!("Signature self-test: FAILED");
            std::process::exit(1);
        }
    }
    println!();
    println!("Install as <data-dir>/node_key.bin, keep the secret key private.");
}
