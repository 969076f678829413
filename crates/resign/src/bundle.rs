use std::path::{Path, PathBuf};

use plist::{Dictionary, Value};
use walkdir::WalkDir;

use crate::{macho, Error, Result};

/// Position of a Mach-O file inside the app bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    Main,
    NestedExecutable,
    Framework,
    PlugIn,
    Dylib,
}

#[derive(Debug, Clone)]
pub struct BinaryRecord {
    pub path: PathBuf,
    pub kind: BinaryKind,
}

/// An exploded `Payload/<Name>.app` directory with its `Info.plist` loaded.
#[derive(Debug, Clone)]
pub struct Bundle {
    appdir: PathBuf,
    info: Dictionary,
}

impl Bundle {
    pub fn open(appdir: impl Into<PathBuf>) -> Result<Self> {
        let appdir = appdir.into();
        let info: Dictionary = plist::from_file(appdir.join("Info.plist"))?;
        Ok(Bundle { appdir, info })
    }

    pub fn appdir(&self) -> &Path {
        &self.appdir
    }

    pub fn bundle_identifier(&self) -> Option<String> {
        self.info
            .get("CFBundleIdentifier")
            .and_then(Value::as_string)
            .map(str::to_string)
    }

    /// `CFBundleExecutable`, falling back to the `.app` stem.
    pub fn executable_name(&self) -> String {
        self.info
            .get("CFBundleExecutable")
            .and_then(Value::as_string)
            .map(str::to_string)
            .unwrap_or_else(|| {
                self.appdir
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
    }

    pub fn executable_path(&self) -> PathBuf {
        self.appdir.join(self.executable_name())
    }

    /// Apply the metadata mutations in one pass. `Info.plist` is written
    /// back only when something changed; optional keys that do not exist are
    /// left uncreated.
    pub fn rewrite_metadata(&mut self, bundle_id: Option<&str>, force_family: bool) -> Result<bool> {
        let mut changed = false;

        if let Some(id) = bundle_id {
            self.info
                .insert("CFBundleIdentifier".into(), Value::String(id.into()));
            changed = true;

            if self.info.contains_key("basebundleidentifier") {
                self.info
                    .insert("basebundleidentifier".into(), Value::String(id.into()));
            }

            if let Some(Value::Array(url_types)) = self.info.get_mut("CFBundleURLTypes") {
                if let Some(Value::Dictionary(first)) = url_types.first_mut() {
                    if first.contains_key("CFBundleURLName") {
                        first.insert("CFBundleURLName".into(), Value::String(id.into()));
                    }
                }
            }
        }

        if force_family {
            if self.info.remove("UISupportedDevices").is_some() {
                changed = true;
            }
            changed |= self.rewrite_device_family();
        }

        if changed {
            plist::to_file_xml(self.appdir.join("Info.plist"), &self.info)?;
        }
        Ok(changed)
    }

    // UIDeviceFamily appears either as a bare integer or a one-element
    // array; 2 means iPad-only and is rewritten to iPhone.
    fn rewrite_device_family(&mut self) -> bool {
        match self.info.get_mut("UIDeviceFamily") {
            Some(Value::Integer(n)) if n.as_signed() == Some(2) => {
                self.info
                    .insert("UIDeviceFamily".into(), Value::Integer(1.into()));
                true
            }
            Some(Value::Array(families)) if families.len() == 1 => {
                let ipad_only =
                    matches!(&families[0], Value::Integer(n) if n.as_signed() == Some(2));
                if ipad_only {
                    families[0] = Value::Integer(1.into());
                }
                ipad_only
            }
            _ => false,
        }
    }

    /// Enumerate every Mach-O file under the bundle, classified by path
    /// position. Symbolic links and non-regular entries are skipped.
    pub fn walk(&self) -> Result<Vec<BinaryRecord>> {
        let main = self.executable_path();
        let mut records = Vec::new();
        let mut main_found = false;

        for entry in WalkDir::new(&self.appdir).follow_links(false) {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(magic) = macho::read_magic(entry.path())? else {
                continue;
            };
            if !macho::is_macho(&magic) {
                continue;
            }

            let path = entry.into_path();
            let kind = if path == main {
                main_found = true;
                BinaryKind::Main
            } else {
                classify(&self.appdir, &path)
            };
            records.push(BinaryRecord { path, kind });
        }

        if !main_found {
            return Err(Error::NoBinariesFound);
        }
        Ok(records)
    }
}

fn classify(appdir: &Path, path: &Path) -> BinaryKind {
    let rel = path.strip_prefix(appdir).unwrap_or(path);
    let parts: Vec<&str> = rel
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    let dirs = &parts[..parts.len().saturating_sub(1)];

    if dirs.contains(&"Frameworks") && dirs.iter().any(|d| d.ends_with(".framework")) {
        BinaryKind::Framework
    } else if dirs.contains(&"PlugIns") {
        BinaryKind::PlugIn
    } else if dirs.iter().any(|d| d.ends_with(".app")) {
        BinaryKind::NestedExecutable
    } else {
        BinaryKind::Dylib
    }
}
