use std::fs;
use std::path::{Path, PathBuf};

use plist::{Dictionary, Value};

use crate::options::ResignOptions;
use crate::provision::{MobileProvision, TEAM_ID_REGEX};
use crate::{macho, Error, Result};

const APPLICATION_IDENTIFIER: &str = "application-identifier";
const TEAM_IDENTIFIER: &str = "com.apple.developer.team-identifier";
const KEYCHAIN_ACCESS_GROUPS: &str = "keychain-access-groups";
const GET_TASK_ALLOW: &str = "get-task-allow";

/// Reconcile the entitlements for one binary and stage the result beside it
/// as `<binary>.entitlements`.
///
/// Precedence: the default template (when requested and the profile carries
/// both identifiers) wins over everything, then a user-supplied entitlement
/// file wins over the profile-vs-binary merge. Unsigned binaries with no
/// override are signed without entitlements.
pub(crate) fn stage(
    binary: &Path,
    profile: &MobileProvision,
    opts: &ResignOptions,
) -> Result<Option<PathBuf>> {
    let out = entitlements_path(binary);

    if opts.use_default_entitlements {
        if let (Some(app_id), Some(team_id)) =
            (profile.application_identifier(), profile.team_identifier())
        {
            let doc = default_document(app_id, team_id);
            write_document(&out, &doc)?;
            return Ok(Some(out));
        }
    }

    if let Some(user_file) = &opts.entitlement {
        fs::copy(user_file, &out).map_err(|e| Error::EntitlementsWriteFailed(e.to_string()))?;
        return Ok(Some(out));
    }

    let Some(mut doc) = macho::read_entitlements(binary)? else {
        return Ok(None);
    };
    merge_with_profile(&mut doc, profile);
    write_document(&out, &doc)?;
    Ok(Some(out))
}

pub(crate) fn entitlements_path(binary: &Path) -> PathBuf {
    let mut path = binary.as_os_str().to_owned();
    path.push(".entitlements");
    PathBuf::from(path)
}

/// The minimal document used when signing from the profile alone.
fn default_document(app_id: &str, team_id: &str) -> Dictionary {
    let mut doc = Dictionary::new();
    doc.insert(APPLICATION_IDENTIFIER.into(), Value::String(app_id.into()));
    doc.insert(TEAM_IDENTIFIER.into(), Value::String(team_id.into()));
    doc.insert(GET_TASK_ALLOW.into(), Value::Boolean(true));
    doc.insert(
        KEYCHAIN_ACCESS_GROUPS.into(),
        Value::Array(vec![Value::String(app_id.into())]),
    );
    doc
}

/// Overwrite the identity keys of a binary's own entitlements with the
/// profile's values. The first keychain access group becomes the
/// application-identifier; remaining groups are re-homed onto the profile's
/// team and non-team groups (e.g. `com.apple.token`) are dropped.
fn merge_with_profile(doc: &mut Dictionary, profile: &MobileProvision) {
    if let Some(app_id) = profile.application_identifier() {
        doc.insert(APPLICATION_IDENTIFIER.into(), Value::String(app_id.into()));
        match doc.get_mut(KEYCHAIN_ACCESS_GROUPS) {
            Some(Value::Array(groups)) if !groups.is_empty() => {
                groups[0] = Value::String(app_id.into());
            }
            _ => {
                doc.insert(
                    KEYCHAIN_ACCESS_GROUPS.into(),
                    Value::Array(vec![Value::String(app_id.into())]),
                );
            }
        }
    }

    if let Some(team_id) = profile.team_identifier() {
        doc.insert(TEAM_IDENTIFIER.into(), Value::String(team_id.into()));

        if let Some(Value::Array(groups)) = doc.get_mut(KEYCHAIN_ACCESS_GROUPS) {
            let re = regex::Regex::new(TEAM_ID_REGEX).unwrap();
            groups.retain(|g| matches!(g, Value::String(s) if re.is_match(s)));
            for group in groups.iter_mut() {
                if let Value::String(s) = group {
                    *s = format!("{}.{}", team_id, &s[11..]);
                }
            }
        }
    }
}

fn write_document(path: &Path, doc: &Dictionary) -> Result<()> {
    Value::Dictionary(doc.clone())
        .to_file_xml(path)
        .map_err(|e| Error::EntitlementsWriteFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(app_id: &str, team_id: &str) -> MobileProvision {
        let mut entitlements = Dictionary::new();
        entitlements.insert(
            APPLICATION_IDENTIFIER.into(),
            Value::String(app_id.into()),
        );
        entitlements.insert(TEAM_IDENTIFIER.into(), Value::String(team_id.into()));
        let mut root = Dictionary::new();
        root.insert("Entitlements".into(), Value::Dictionary(entitlements));
        let mut xml = Vec::new();
        Value::Dictionary(root).to_writer_xml(&mut xml).unwrap();
        MobileProvision::load_with_bytes(xml).unwrap()
    }

    #[test]
    fn merge_overwrites_identity_keys() {
        let prov = profile("NEWTEAM000.com.ex.new", "NEWTEAM000");
        let mut doc = Dictionary::new();
        doc.insert(
            APPLICATION_IDENTIFIER.into(),
            Value::String("OLDTEAM000.com.ex.old".into()),
        );
        doc.insert(
            KEYCHAIN_ACCESS_GROUPS.into(),
            Value::Array(vec![
                Value::String("OLDTEAM000.com.ex.old".into()),
                Value::String("OLDTEAM000.com.ex.shared".into()),
                Value::String("com.apple.token".into()),
            ]),
        );

        merge_with_profile(&mut doc, &prov);

        assert_eq!(
            doc.get(APPLICATION_IDENTIFIER).and_then(Value::as_string),
            Some("NEWTEAM000.com.ex.new")
        );
        assert_eq!(
            doc.get(TEAM_IDENTIFIER).and_then(Value::as_string),
            Some("NEWTEAM000")
        );
        let groups = doc
            .get(KEYCHAIN_ACCESS_GROUPS)
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(
            groups[0].as_string(),
            Some("NEWTEAM000.com.ex.new")
        );
        assert_eq!(
            groups[1].as_string(),
            Some("NEWTEAM000.com.ex.shared")
        );
        assert_eq!(groups.len(), 2); // com.apple.token dropped
    }

    #[test]
    fn merge_creates_access_groups_when_absent() {
        let prov = profile("NEWTEAM000.com.ex.new", "NEWTEAM000");
        let mut doc = Dictionary::new();

        merge_with_profile(&mut doc, &prov);

        let groups = doc
            .get(KEYCHAIN_ACCESS_GROUPS)
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].as_string(), Some("NEWTEAM000.com.ex.new"));
    }

    #[test]
    fn default_document_shape() {
        let doc = default_document("NEWTEAM000.com.ex.new", "NEWTEAM000");
        assert_eq!(
            doc.get(GET_TASK_ALLOW).and_then(Value::as_boolean),
            Some(true)
        );
        let groups = doc
            .get(KEYCHAIN_ACCESS_GROUPS)
            .and_then(Value::as_array)
            .unwrap();
        assert_eq!(groups[0].as_string(), Some("NEWTEAM000.com.ex.new"));
    }

    #[test]
    fn user_file_is_copied_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("custom.entitlements");
        fs::write(&user, b"<plist version=\"1.0\"><dict/></plist>").unwrap();
        let binary = dir.path().join("Demo");
        fs::write(&binary, b"not a macho").unwrap();

        let mut opts = ResignOptions::new("demo.ipa", "X");
        opts.entitlement = Some(user.clone());
        let prov = profile("NEWTEAM000.com.ex.new", "NEWTEAM000");

        let staged = stage(&binary, &prov, &opts).unwrap().unwrap();
        assert_eq!(staged, dir.path().join("Demo.entitlements"));
        assert_eq!(fs::read(&staged).unwrap(), fs::read(&user).unwrap());
    }

    #[test]
    fn unsigned_binary_without_overrides_stages_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("Demo");
        fs::write(&binary, b"not a macho").unwrap();

        let opts = ResignOptions::new("demo.ipa", "X");
        let prov = profile("NEWTEAM000.com.ex.new", "NEWTEAM000");

        assert!(stage(&binary, &prov, &opts).unwrap().is_none());
    }

    #[test]
    fn default_template_wins_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("Demo");
        fs::write(&binary, b"not a macho").unwrap();

        let mut opts = ResignOptions::new("demo.ipa", "X");
        opts.use_default_entitlements = true;
        let prov = profile("NEWTEAM000.com.ex.new", "NEWTEAM000");

        let staged = stage(&binary, &prov, &opts).unwrap().unwrap();
        let doc: Dictionary = plist::from_file(&staged).unwrap();
        assert_eq!(
            doc.get(APPLICATION_IDENTIFIER).and_then(Value::as_string),
            Some("NEWTEAM000.com.ex.new")
        );
    }
}
