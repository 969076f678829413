use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use resign::{find_identities, ResignOptions, Session};

#[derive(Debug, Parser)]
#[command(
    name = "resign",
    author,
    version,
    about = "Re-sign iOS application archives",
    arg_required_else_help = true
)]
struct Cli {
    /// Input IPA to resign
    #[arg(value_name = "IPA", required_unless_present = "identities")]
    file: Option<PathBuf>,
    /// Signing identity passed to codesign
    #[arg(short, long, value_name = "IDENTITY", required_unless_present = "identities")]
    identity: Option<String>,
    /// Output IPA path (defaults to `<stem>-resigned.ipa`)
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Working directory (defaults to `<IPA>.d`)
    #[arg(long, value_name = "DIR")]
    outdir: Option<PathBuf>,
    /// Keychain holding the signing identity
    #[arg(short, long, value_name = "KEYCHAIN")]
    keychain: Option<String>,
    /// Provisioning profile to embed
    #[arg(short, long, value_name = "PROFILE")]
    mobileprovision: Option<PathBuf>,
    /// Entitlement file used verbatim instead of reconciling
    #[arg(short, long, value_name = "PLIST")]
    entitlement: Option<PathBuf>,
    /// New bundle identifier
    #[arg(short, long, value_name = "BUNDLEID")]
    bundleid: Option<String>,
    /// Rewrite iPad-only device metadata to iPhone
    #[arg(long)]
    force_family: bool,
    /// Remove Watch/ and PlugIns/ before signing
    #[arg(long)]
    without_watchapp: bool,
    /// Sign FairPlay-encrypted binaries instead of failing
    #[arg(long = "unfair")]
    unfair_play: bool,
    /// Sign independent binaries in parallel
    #[arg(short, long)]
    parallel: bool,
    /// Verify each binary immediately after signing it
    #[arg(long)]
    verify_twice: bool,
    /// Downgrade signer failures to warnings
    #[arg(long)]
    ignore_codesign_errors: bool,
    /// Downgrade verifier failures to warnings
    #[arg(long)]
    ignore_verification_errors: bool,
    /// Overwrite the input archive with the output on success
    #[arg(long = "replace")]
    replace_ipa: bool,
    /// Sign with a default entitlement document built from the profile
    #[arg(long)]
    default_entitlements: bool,
    /// List available signing identities and exit
    #[arg(short = 'L', long)]
    identities: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if cli.identities {
        for line in find_identities().await? {
            println!("{line}");
        }
        return Ok(());
    }

    let file = cli.file.context("input archive is required")?;
    let identity = cli.identity.context("signing identity is required")?;

    let mut opts = ResignOptions::new(file, identity);
    opts.outfile = cli.output;
    opts.outdir = cli.outdir;
    opts.keychain = cli.keychain;
    opts.mobileprovision = cli.mobileprovision;
    opts.entitlement = cli.entitlement;
    opts.bundleid = cli.bundleid;
    opts.force_family = cli.force_family;
    opts.without_watchapp = cli.without_watchapp;
    opts.unfair_play = cli.unfair_play;
    opts.parallel = cli.parallel;
    opts.verify_twice = cli.verify_twice;
    opts.ignore_codesign_errors = cli.ignore_codesign_errors;
    opts.ignore_verification_errors = cli.ignore_verification_errors;
    opts.replace_ipa = cli.replace_ipa;
    opts.use_default_entitlements = cli.default_entitlements;

    // progress already reaches the terminal through the log mirror
    let (session, _events) = Session::new(opts);
    session.run().await?;

    Ok(())
}
