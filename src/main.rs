use std::fs;
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::process;

use clap::error::ErrorKind;
use clap::Parser;

use pdf_seal::openssl::OpenSslSigner;

/// Sign a PDF document with a detached PKCS #7 signature.
#[derive(Parser, Debug)]
#[command(name = "pdf-seal", version, about)]
struct Args {
    /// Space in bytes to reserve for the hex-encoded signature
    #[arg(
        short,
        long,
        default_value_t = 4096,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    reservation: u16,

    /// The PDF document to sign
    input: PathBuf,
    /// Where to write the signed document
    output: PathBuf,
    /// PKCS #12 bundle holding the signing key and certificate chain
    pkcs12_path: PathBuf,
    /// Passphrase unlocking the bundle
    pkcs12_pass: String,
}

fn die(status: i32, message: &str) -> ! {
    let stderr = std::io::stderr();
    let _ = if stderr.is_terminal() {
        writeln!(stderr.lock(), "\x1b[31m{message}\x1b[0m")
    } else {
        writeln!(stderr.lock(), "{message}")
    };
    process::exit(status)
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // Usage problems and --help exit 1, unlike --version
            let status = i32::from(e.kind() != ErrorKind::DisplayVersion);
            let _ = e.print();
            process::exit(status);
        }
    };

    let mut document = match fs::read(&args.input) {
        Ok(document) => document,
        Err(e) => die(1, &format!("{}: {}", args.input.display(), e)),
    };

    let result = OpenSslSigner::from_pkcs12_file(&args.pkcs12_path, &args.pkcs12_pass)
        .and_then(|signer| pdf_seal::sign(&mut document, args.reservation, &signer));
    if let Err(e) = result {
        die(2, &format!("Error: {e:#}"));
    }

    if let Err(e) = fs::write(&args.output, &document) {
        let _ = fs::remove_file(&args.output);
        die(3, &format!("{}: {}", args.output.display(), e));
    }
}
