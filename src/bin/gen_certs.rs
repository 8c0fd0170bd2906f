//! Certificate Generation Tool
//!
//! Writes a self-signed certificate and key into the certificate store and
//! prints the thumbprint to pass to `dummy-smtp --thumbprint`.

use anyhow::Result;
use clap::Parser;
use dummy_smtp::tls::{CertificateHandle, CertificateProvider, DirectoryCertificateStore};
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, SanType};
use std::path::PathBuf;
use std::time::Duration;

/// Generate a STARTTLS certificate for Dummy SMTP
#[derive(Parser, Debug)]
#[command(name = "dummy-smtp-gen-certs")]
#[command(about = "Generate a self-signed STARTTLS certificate")]
#[command(version)]
struct Args {
    /// Hostname for the certificate
    #[arg(short = 'n', long, default_value = "localhost")]
    hostname: String,

    /// Certificate store directory
    #[arg(short, long, default_value = "certs")]
    output: PathBuf,

    /// Base file name for <name>.crt and <name>.key
    #[arg(long, default_value = "server")]
    name: String,

    /// Validity in days
    #[arg(short, long, default_value = "365")]
    days: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    println!("Generating TLS certificate for: {}", args.hostname);
    println!("Certificate store: {}", args.output.display());

    // Create output directory
    std::fs::create_dir_all(&args.output)?;

    let mut params = CertificateParams::new(vec![args.hostname.clone()]);
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::OrganizationName, "Dummy SMTP");
    params.distinguished_name.push(DnType::CommonName, &args.hostname);
    params.subject_alt_names = vec![SanType::DnsName(args.hostname.clone())];

    // Set validity
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + Duration::from_secs(args.days * 24 * 60 * 60);

    // Key usage
    params.key_usages = vec![rcgen::KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

    let cert = Certificate::from_params(params)?;
    let cert_pem = cert.serialize_pem()?;
    let key_pem = cert.serialize_private_key_pem();

    let cert_path = args.output.join(format!("{}.crt", args.name));
    let key_path = args.output.join(format!("{}.key", args.name));
    std::fs::write(&cert_path, &cert_pem)?;
    std::fs::write(&key_path, &key_pem)?;

    // Read it back through the store so the printed thumbprint is the one the server resolves
    let thumbprint = CertificateHandle::from_pem(cert_pem.as_bytes(), key_pem.as_bytes())?.thumbprint();
    DirectoryCertificateStore::new(&args.output).resolve(&thumbprint)?;

    println!();
    println!("Generated certificate:");
    println!("  Certificate: {}", cert_path.display());
    println!("  Key: {}", key_path.display());
    println!("  Thumbprint: {}", thumbprint);
    println!();
    println!("Start the server with:");
    println!(
        "  dummy-smtp --thumbprint {} (cert_store: {})",
        thumbprint,
        args.output.display()
    );
    println!("Clients can trust {} as their CA certificate.", cert_path.display());

    Ok(())
}
