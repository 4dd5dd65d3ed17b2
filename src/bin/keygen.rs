//! Key generation tool for Filament identities
//!
//! Generates a secp256k1 keypair, writes the private key hex to a file, and
//! prints the seed-list form of the public key.
//!
//! Usage:
//!   cargo run --bin keygen -- --output ./node.key

use clap::Parser;
use filament::Identity;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keygen", version, about = "Filament key generator")]
struct Args {
    /// Output file for the private key (hex).
    #[arg(short, long, default_value = "./filament.key")]
    output: PathBuf,

    /// Overwrite an existing key file.
    #[arg(long)]
    force: bool,
}

fn main() {
    let args = Args::parse();

    if args.output.exists() && !args.force {
        eprintln!("refusing to overwrite {} (use --force)", args.output.display());
        std::process::exit(1);
    }

    let identity = Identity::generate();
    if let Err(e) = std::fs::write(&args.output, identity.private_key_hex()) {
        eprintln!("failed to write {}: {}", args.output.display(), e);
        std::process::exit(1);
    }

    println!("private key written to {}", args.output.display());
    println!();
    println!("public key : {}", hex::encode(identity.peer_id()));
    println!("node id    : {}", hex::encode(identity.node_id()));
    println!();
    println!("seed-list entry: {}@<ip>:<port>", hex::encode(identity.peer_id()));

    // Round-trip sanity check.
    let digest = filament::crypto::hash(b"filament keygen self test");
    let signature = identity.sign_recoverable(&digest);
    match filament::crypto::verify_recover(&digest, &signature) {
        Ok(recovered) if recovered == *identity.public_key() => {
            println!("signature self-test: ok");
        }
        _ => {
            eprintln!("signature self-test FAILED");
            std::process::exit(1);
        }
    }
}
