use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use futures::future::try_join_all;

use crate::bundle::{BinaryRecord, Bundle};
use crate::depgraph::{self, SigningPlan};
use crate::events::{self, EventReceiver, EventSender};
use crate::options::ResignOptions;
use crate::provision::MobileProvision;
use crate::{codesign, entitlements, macho, package, Error, Result};

/// Stderr marker `codesign` prints when the requested identity exists in no
/// searched keychain. Never downgraded to a warning.
const NO_IDENTITY_MARKER: &str = "no identity found";

/// One resigning run over one archive.
///
/// The session owns its working directory (`<archive>.d`) from the first
/// pipeline step until [`run`](Session::run) resolves; the directory is
/// removed on success and on failure alike.
pub struct Session {
    opts: ResignOptions,
    events: EventSender,
    workdir: PathBuf,
}

impl Session {
    pub fn new(opts: ResignOptions) -> (Self, EventReceiver) {
        let (events, rx) = events::channel();
        let workdir = opts.workdir();
        (
            Session {
                opts,
                events,
                workdir,
            },
            rx,
        )
    }

    /// Drive the pipeline to completion and return the final archive path.
    ///
    /// This future resolving is the session's single terminal event; the
    /// progress channel carries only messages and warnings.
    pub async fn run(self) -> Result<PathBuf> {
        let outcome = self.pipeline().await;

        if let Err(e) = tokio::fs::remove_dir_all(&self.workdir).await {
            if self.workdir.exists() {
                return match outcome {
                    // cleanup is the only thing that went wrong
                    Ok(_) => Err(Error::CleanupFailed(e.to_string())),
                    // the original error wins; cleanup trouble is informational
                    Err(original) => {
                        self.events.message(format!(
                            "Failed to remove {}: {e}",
                            self.workdir.display()
                        ));
                        Err(original)
                    }
                };
            }
        }
        outcome
    }

    async fn pipeline(&self) -> Result<PathBuf> {
        let mut bundle = self.unpack().await?;
        let records = self.discover(&bundle).await?;
        self.rewrite_metadata(&mut bundle).await?;
        let staged = self.stage_entitlements(&bundle, &records)?;
        let plan = self.compute_plan(&bundle, &records)?;
        self.sign_all(&plan, &staged).await?;
        self.verify_all(&plan).await?;
        self.repack(&staged).await
    }

    async fn unpack(&self) -> Result<Bundle> {
        if self.workdir.exists() {
            tokio::fs::remove_dir_all(&self.workdir).await?;
        }
        let appdir = package::extract(&self.opts.file, &self.workdir)?;
        self.events.message(format!(
            "Unpacked {} into {}",
            self.opts.file.display(),
            self.workdir.display()
        ));

        let bundle = Bundle::open(appdir)?;
        self.events.message(format!(
            "Main executable is {}",
            bundle.executable_path().display()
        ));
        Ok(bundle)
    }

    async fn discover(&self, bundle: &Bundle) -> Result<Vec<BinaryRecord>> {
        if macho::is_encrypted(bundle.executable_path())? {
            if !self.opts.unfair_play {
                return Err(Error::Encrypted);
            }
            self.events
                .warning("Main binary is FairPlay-encrypted; signing it anyway");
        }

        if self.opts.without_watchapp {
            for dir in ["Watch", "PlugIns"] {
                let path = bundle.appdir().join(dir);
                if path.is_dir() {
                    tokio::fs::remove_dir_all(&path).await?;
                    self.events.message(format!("Removed {dir}/"));
                }
            }
        }

        let records = bundle.walk()?;
        self.events
            .message(format!("Found {} Mach-O binaries", records.len()));
        Ok(records)
    }

    async fn rewrite_metadata(&self, bundle: &mut Bundle) -> Result<()> {
        if bundle.rewrite_metadata(self.opts.bundleid.as_deref(), self.opts.force_family)? {
            self.events.message("Rewrote Info.plist");
        }
        if let Some(profile) = &self.opts.mobileprovision {
            tokio::fs::copy(profile, bundle.appdir().join("embedded.mobileprovision")).await?;
            self.events.message("Embedded provisioning profile");
        }
        Ok(())
    }

    /// Reconcile and write the entitlement side-file for every binary, in
    /// plan-independent record order. Each binary gets its own file, so the
    /// signing pass never mutates a file another signing call is reading.
    fn stage_entitlements(
        &self,
        bundle: &Bundle,
        records: &[BinaryRecord],
    ) -> Result<BTreeMap<PathBuf, PathBuf>> {
        let profile_path = self
            .opts
            .mobileprovision
            .clone()
            .unwrap_or_else(|| bundle.appdir().join("embedded.mobileprovision"));
        let profile = MobileProvision::load_with_path(&profile_path)?;

        if let Some(bundle_id) = bundle.bundle_identifier() {
            if !profile.matches_bundle_id(&bundle_id) {
                self.events.warning(format!(
                    "Provisioning profile covers {} but the bundle identifier is {bundle_id}",
                    profile.bundle_id().unwrap_or_default()
                ));
            }
        }

        let mut staged = BTreeMap::new();
        for record in records {
            if let Some(path) = entitlements::stage(&record.path, &profile, &self.opts)? {
                staged.insert(record.path.clone(), path);
            }
        }
        self.events.message(format!(
            "Staged entitlements for {} of {} binaries",
            staged.len(),
            records.len()
        ));
        Ok(staged)
    }

    fn compute_plan(&self, bundle: &Bundle, records: &[BinaryRecord]) -> Result<SigningPlan> {
        let candidates: Vec<PathBuf> = records.iter().map(|r| r.path.clone()).collect();
        let plan = depgraph::signing_plan(
            bundle.appdir(),
            &bundle.executable_path(),
            &candidates,
            self.opts.parallel,
        )?;
        match &plan {
            SigningPlan::Flat(order) => self
                .events
                .message(format!("Signing {} binaries serially", order.len())),
            SigningPlan::Layered(layers) => self.events.message(format!(
                "Signing {} binaries in {} layers",
                plan.len(),
                layers.len()
            )),
        }
        Ok(plan)
    }

    async fn sign_all(
        &self,
        plan: &SigningPlan,
        staged: &BTreeMap<PathBuf, PathBuf>,
    ) -> Result<()> {
        match plan {
            SigningPlan::Flat(order) => {
                for path in order {
                    self.sign_one(path, staged.get(path)).await?;
                }
            }
            SigningPlan::Layered(layers) => {
                for layer in layers {
                    try_join_all(
                        layer
                            .iter()
                            .map(|path| self.sign_one(path, staged.get(path))),
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn sign_one(&self, path: &Path, entitlement: Option<&PathBuf>) -> Result<()> {
        let outcome = codesign::sign(
            &self.opts.identity,
            entitlement.map(PathBuf::as_path),
            self.opts.keychain.as_deref(),
            path,
        )
        .await;

        match outcome {
            Ok(out) if out.success => {
                self.events.message(format!("Signed {}", path.display()));
            }
            Ok(out) => {
                if out.stderr.contains(NO_IDENTITY_MARKER) {
                    return Err(Error::IdentityNotFound);
                }
                self.signing_failure(path, out.stderr)?;
            }
            Err(e) => self.signing_failure(path, e.to_string())?,
        }

        if self.opts.verify_twice {
            self.verify_one(path).await?;
        }
        Ok(())
    }

    fn signing_failure(&self, path: &Path, stderr: String) -> Result<()> {
        if self.opts.ignore_codesign_errors {
            self.events.warning(format!(
                "codesign failed on {}: {}",
                path.display(),
                stderr.trim()
            ));
            Ok(())
        } else {
            Err(Error::SignFailed {
                path: path.to_path_buf(),
                stderr,
            })
        }
    }

    async fn verify_all(&self, plan: &SigningPlan) -> Result<()> {
        match plan {
            SigningPlan::Flat(order) => {
                for path in order {
                    self.verify_one(path).await?;
                }
            }
            SigningPlan::Layered(_) => {
                try_join_all(plan.binaries().into_iter().map(|path| self.verify_one(path)))
                    .await?;
            }
        }
        Ok(())
    }

    async fn verify_one(&self, path: &Path) -> Result<()> {
        let outcome = codesign::verify(path, self.opts.keychain.as_deref()).await;

        match outcome {
            Ok(out) if out.success => {
                self.events.message(format!("Verified {}", path.display()));
                Ok(())
            }
            Ok(out) => self.verification_failure(path, out.stderr),
            Err(e) => self.verification_failure(path, e.to_string()),
        }
    }

    fn verification_failure(&self, path: &Path, stderr: String) -> Result<()> {
        if self.opts.ignore_verification_errors {
            self.events.warning(format!(
                "Verification failed on {}: {}",
                path.display(),
                stderr.trim()
            ));
            Ok(())
        } else {
            Err(Error::VerifyFailed {
                path: path.to_path_buf(),
                stderr,
            })
        }
    }

    async fn repack(&self, staged: &BTreeMap<PathBuf, PathBuf>) -> Result<PathBuf> {
        for side_file in staged.values() {
            tokio::fs::remove_file(side_file).await.ok();
        }

        let out = self.opts.output();
        package::compress(&self.workdir, &out)?;

        if self.opts.replace_ipa {
            tokio::fs::rename(&out, &self.opts.file)
                .await
                .map_err(|e| Error::RepackFailed(e.to_string()))?;
            self.events
                .message(format!("Replaced {}", self.opts.file.display()));
            return Ok(self.opts.file.clone());
        }

        self.events.message(format!("Wrote {}", out.display()));
        Ok(out)
    }
}
