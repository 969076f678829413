use std::path::PathBuf;

/// Settings for one resigning session.
#[derive(Clone, Debug)]
pub struct ResignOptions {
    /// Input IPA path.
    pub file: PathBuf,
    /// Output IPA path. Derived as `<stem>-resigned.ipa` when unset.
    pub outfile: Option<PathBuf>,
    /// Working directory. Derived as `<file>.d` when unset.
    pub outdir: Option<PathBuf>,
    /// Signing identity handed to the external signer.
    pub identity: String,
    /// Keychain reference for the signer and verifier.
    pub keychain: Option<String>,
    /// Provisioning profile to embed. The profile already embedded in the
    /// bundle is used when unset.
    pub mobileprovision: Option<PathBuf>,
    /// Entitlement file copied verbatim instead of reconciling.
    pub entitlement: Option<PathBuf>,
    /// New CFBundleIdentifier.
    pub bundleid: Option<String>,
    /// Rewrite iPad-only device metadata to iPhone.
    pub force_family: bool,
    /// Remove Watch/ and PlugIns/ before signing.
    pub without_watchapp: bool,
    /// Sign FairPlay-encrypted binaries instead of failing.
    pub unfair_play: bool,
    /// Sign independent binaries of one layer concurrently.
    pub parallel: bool,
    /// Verify each binary immediately after its signing call.
    pub verify_twice: bool,
    /// Downgrade signer failures to warnings.
    pub ignore_codesign_errors: bool,
    /// Downgrade verifier failures to warnings.
    pub ignore_verification_errors: bool,
    /// Overwrite the input archive with the output on success.
    pub replace_ipa: bool,
    /// Build a default entitlement document from the profile instead of
    /// merging the binary's own entitlements.
    pub use_default_entitlements: bool,
}

impl ResignOptions {
    pub fn new(file: impl Into<PathBuf>, identity: impl Into<String>) -> Self {
        ResignOptions {
            file: file.into(),
            outfile: None,
            outdir: None,
            identity: identity.into(),
            keychain: None,
            mobileprovision: None,
            entitlement: None,
            bundleid: None,
            force_family: false,
            without_watchapp: false,
            unfair_play: false,
            parallel: false,
            verify_twice: false,
            ignore_codesign_errors: false,
            ignore_verification_errors: false,
            replace_ipa: false,
            use_default_entitlements: false,
        }
    }

    /// Working directory owned by the session for its whole lifetime.
    pub fn workdir(&self) -> PathBuf {
        self.outdir.clone().unwrap_or_else(|| {
            let mut dir = self.file.as_os_str().to_owned();
            dir.push(".d");
            PathBuf::from(dir)
        })
    }

    /// Destination archive path.
    pub fn output(&self) -> PathBuf {
        self.outfile.clone().unwrap_or_else(|| {
            let stem = self
                .file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.file.with_file_name(format!("{stem}-resigned.ipa"))
        })
    }
}
