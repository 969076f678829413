use std::fs;
use std::path::Path;

use plist::{Dictionary, Value};

use crate::{Error, Result};

/// Team-scoped identifier prefix, e.g. `ABCDE12345.`.
pub(crate) const TEAM_ID_REGEX: &str = r"^[A-Z0-9]{10}\.";

/// A mobile provisioning profile: the raw CMS-wrapped bytes plus the
/// entitlements dictionary extracted from the embedded property list.
#[derive(Debug, Clone)]
pub struct MobileProvision {
    pub data: Vec<u8>,
    entitlements: Dictionary,
}

impl MobileProvision {
    pub fn load_with_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(path.as_ref())?;
        Self::load_with_bytes(data)
    }

    pub fn load_with_bytes(data: Vec<u8>) -> Result<Self> {
        let entitlements = Self::extract_entitlements(&data)?;
        Ok(Self { data, entitlements })
    }

    pub fn entitlements(&self) -> &Dictionary {
        &self.entitlements
    }

    pub fn application_identifier(&self) -> Option<&str> {
        self.entitlements
            .get("application-identifier")
            .and_then(Value::as_string)
    }

    pub fn team_identifier(&self) -> Option<&str> {
        self.entitlements
            .get("com.apple.developer.team-identifier")
            .and_then(Value::as_string)
    }

    /// The application-identifier with the team prefix stripped. May contain
    /// a trailing wildcard.
    pub fn bundle_id(&self) -> Option<String> {
        let app_id = self.application_identifier()?;
        let re = regex::Regex::new(TEAM_ID_REGEX).ok()?;
        Some(re.replace(app_id, "").to_string())
    }

    /// Whether this profile's application-identifier covers the given bundle
    /// identifier. A profile without an application-identifier is treated as
    /// covering everything.
    pub fn matches_bundle_id(&self, bundle_id: &str) -> bool {
        let Some(pattern) = self.bundle_id() else {
            return true;
        };
        match pattern.strip_suffix('*') {
            Some(prefix) => bundle_id.starts_with(prefix),
            None => bundle_id == pattern,
        }
    }

    // The profile is a CMS envelope around an XML plist; the payload sits
    // between the first `<plist` and the last `</plist>`.
    fn extract_entitlements(data: &[u8]) -> Result<Dictionary> {
        let start = data
            .windows(6)
            .position(|w| w == b"<plist")
            .ok_or(Error::ProfileUnreadable)?;
        let end = data
            .windows(8)
            .rposition(|w| w == b"</plist>")
            .ok_or(Error::ProfileUnreadable)?
            + 8;
        if end <= start {
            return Err(Error::ProfileUnreadable);
        }
        let plist = Value::from_reader_xml(&data[start..end]).map_err(|_| Error::ProfileUnreadable)?;

        plist
            .as_dictionary()
            .and_then(|d| d.get("Entitlements"))
            .and_then(Value::as_dictionary)
            .cloned()
            .ok_or(Error::ProfileUnreadable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_bytes(app_id: &str, team_id: &str) -> Vec<u8> {
        let mut entitlements = Dictionary::new();
        entitlements.insert(
            "application-identifier".into(),
            Value::String(app_id.into()),
        );
        entitlements.insert(
            "com.apple.developer.team-identifier".into(),
            Value::String(team_id.into()),
        );
        let mut root = Dictionary::new();
        root.insert("Name".into(), Value::String("Test Profile".into()));
        root.insert("Entitlements".into(), Value::Dictionary(entitlements));

        let mut xml = Vec::new();
        Value::Dictionary(root).to_writer_xml(&mut xml).unwrap();

        let mut data = b"\x30\x82\x01\x00cms-header-junk".to_vec();
        data.extend(xml);
        data.extend(b"cms-trailer-junk");
        data
    }

    #[test]
    fn extracts_entitlements_from_wrapped_plist() {
        let prov =
            MobileProvision::load_with_bytes(profile_bytes("ABCDE12345.com.ex.app", "ABCDE12345"))
                .unwrap();
        assert_eq!(
            prov.application_identifier(),
            Some("ABCDE12345.com.ex.app")
        );
        assert_eq!(prov.team_identifier(), Some("ABCDE12345"));
    }

    #[test]
    fn missing_payload_is_unreadable() {
        let err = MobileProvision::load_with_bytes(b"not a profile".to_vec()).unwrap_err();
        assert!(matches!(err, Error::ProfileUnreadable));
    }

    #[test]
    fn missing_entitlements_key_is_unreadable() {
        let mut xml = Vec::new();
        Value::Dictionary(Dictionary::new())
            .to_writer_xml(&mut xml)
            .unwrap();
        let err = MobileProvision::load_with_bytes(xml).unwrap_err();
        assert!(matches!(err, Error::ProfileUnreadable));
    }

    #[test]
    fn bundle_id_strips_team_prefix() {
        let prov =
            MobileProvision::load_with_bytes(profile_bytes("ABCDE12345.com.ex.app", "ABCDE12345"))
                .unwrap();
        assert_eq!(prov.bundle_id().as_deref(), Some("com.ex.app"));
    }

    #[test]
    fn wildcard_identifier_matches_by_prefix() {
        let prov =
            MobileProvision::load_with_bytes(profile_bytes("ABCDE12345.com.ex.*", "ABCDE12345"))
                .unwrap();
        assert!(prov.matches_bundle_id("com.ex.app"));
        assert!(prov.matches_bundle_id("com.ex.other"));
        assert!(!prov.matches_bundle_id("org.else.app"));
    }

    #[test]
    fn exact_identifier_requires_equality() {
        let prov =
            MobileProvision::load_with_bytes(profile_bytes("ABCDE12345.com.ex.app", "ABCDE12345"))
                .unwrap();
        assert!(prov.matches_bundle_id("com.ex.app"));
        assert!(!prov.matches_bundle_id("com.ex.app2"));
    }
}
