use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use apple_codesign::MachFile;
use goblin::mach::load_command::{
    CommandVariant, LC_LOAD_DYLIB, LC_LOAD_UPWARD_DYLIB, LC_LOAD_WEAK_DYLIB, LC_REEXPORT_DYLIB,
};
use goblin::mach::{Mach, MachO};
use plist::{Dictionary, Value};

use crate::Result;

/// Mach-O magic values as they appear on disk: fat, 32-bit LE, 64-bit LE,
/// and big-endian thin.
const MACHO_MAGICS: [[u8; 4]; 4] = [
    [0xca, 0xfe, 0xba, 0xbe],
    [0xce, 0xfa, 0xed, 0xfe],
    [0xcf, 0xfa, 0xed, 0xfe],
    [0xfe, 0xed, 0xfa, 0xce],
];

const DYLIB_COMMANDS: &[u32] = &[
    LC_LOAD_DYLIB,
    LC_LOAD_WEAK_DYLIB,
    LC_REEXPORT_DYLIB,
    LC_LOAD_UPWARD_DYLIB,
];

pub fn is_macho(magic: &[u8; 4]) -> bool {
    MACHO_MAGICS.contains(magic)
}

/// Read the first four bytes of a file. Returns `None` for files shorter
/// than a magic.
pub(crate) fn read_magic(path: &Path) -> io::Result<Option<[u8; 4]>> {
    let mut magic = [0u8; 4];
    match File::open(path)?.read_exact(&mut magic) {
        Ok(()) => Ok(Some(magic)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// True when any architecture slice carries an encryption-info load command
/// with a non-zero crypt id. A binary goblin cannot parse is reported as not
/// encrypted; the external signer will reject it on its own terms.
pub fn is_encrypted(path: impl AsRef<Path>) -> Result<bool> {
    let data = fs::read(path.as_ref())?;
    let encrypted = match Mach::parse(&data) {
        Ok(Mach::Binary(macho)) => slice_is_encrypted(&macho),
        Ok(Mach::Fat(fat)) => {
            let mut any = false;
            for arch in fat.iter_arches().flatten() {
                let start = arch.offset as usize;
                let end = start + arch.size as usize;
                if end > data.len() {
                    continue;
                }
                if let Ok(macho) = MachO::parse(&data[start..end], 0) {
                    any = any || slice_is_encrypted(&macho);
                }
            }
            any
        }
        Err(_) => false,
    };
    Ok(encrypted)
}

fn slice_is_encrypted(macho: &MachO) -> bool {
    macho.load_commands.iter().any(|lc| match lc.command {
        CommandVariant::EncryptionInfo32(info) => info.cryptid != 0,
        CommandVariant::EncryptionInfo64(info) => info.cryptid != 0,
        _ => false,
    })
}

/// Extract the entitlements embedded in the code-signature blob.
///
/// Returns `None` for unsigned or malformed binaries; only I/O errors
/// surface.
pub fn read_entitlements(path: impl AsRef<Path>) -> Result<Option<Dictionary>> {
    let data = fs::read(path.as_ref())?;
    Ok(embedded_entitlements(&data))
}

fn embedded_entitlements(data: &[u8]) -> Option<Dictionary> {
    let mach = MachFile::parse(data).ok()?;
    let macho = mach.nth_macho(0).ok()?;
    let signature = macho.code_signature().ok()??;
    let slot = signature.entitlements().ok()??;
    match Value::from_reader_xml(slot.to_string().as_bytes()).ok()? {
        Value::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

/// Dylib references of the first architecture slice, in load-command order.
///
/// Covers `LC_LOAD_DYLIB`, `LC_LOAD_WEAK_DYLIB`, `LC_REEXPORT_DYLIB`, and
/// `LC_LOAD_UPWARD_DYLIB`. A malformed binary yields an empty list.
pub fn linked_libraries(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let data = fs::read(path.as_ref())?;
    let paths = match Mach::parse(&data) {
        Ok(Mach::Binary(macho)) => slice_libraries(&data, &macho),
        Ok(Mach::Fat(fat)) => match fat.iter_arches().flatten().next() {
            Some(arch) => {
                let start = arch.offset as usize;
                let end = start + arch.size as usize;
                if end > data.len() {
                    Vec::new()
                } else {
                    let slice = &data[start..end];
                    MachO::parse(slice, 0)
                        .map(|macho| slice_libraries(slice, &macho))
                        .unwrap_or_default()
                }
            }
            None => Vec::new(),
        },
        Err(_) => Vec::new(),
    };
    Ok(paths)
}

fn slice_libraries(data: &[u8], macho: &MachO) -> Vec<String> {
    macho
        .load_commands
        .iter()
        .filter(|lc| DYLIB_COMMANDS.contains(&lc.command.cmd()))
        .filter_map(|lc| {
            // every dylib_command stores the command-relative offset of its
            // name string in the field at +8; goblin only destructures the
            // plain LC_LOAD_DYLIB variant, the rest are read raw
            let name_offset = match &lc.command {
                CommandVariant::LoadDylib(dylib) => Some(dylib.dylib.name),
                _ => dylib_name_offset(data, lc.offset),
            }?;
            dylib_name(data, lc.offset, name_offset)
        })
        .collect()
}

fn dylib_name_offset(data: &[u8], cmd_offset: usize) -> Option<u32> {
    let field = data.get(cmd_offset + 8..cmd_offset + 12)?;
    Some(u32::from_le_bytes(field.try_into().ok()?))
}

fn dylib_name(data: &[u8], cmd_offset: usize, name_offset: u32) -> Option<String> {
    let start = cmd_offset.checked_add(name_offset as usize)?;
    let tail = data.get(start..)?;
    if tail.is_empty() {
        return None;
    }
    let len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    std::str::from_utf8(&tail[..len]).ok().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LC_ENCRYPTION_INFO_64: u32 = 0x2c;

    /// Assemble a minimal 64-bit Mach-O executable image from raw load
    /// commands.
    fn macho_image(commands: &[Vec<u8>]) -> Vec<u8> {
        let body: Vec<u8> = commands.concat();
        let mut data = Vec::new();
        data.extend(0xfeed_facf_u32.to_le_bytes()); // MH_MAGIC_64
        data.extend(0x0100_000c_u32.to_le_bytes()); // CPU_TYPE_ARM64
        data.extend(0u32.to_le_bytes()); // cpusubtype
        data.extend(2u32.to_le_bytes()); // MH_EXECUTE
        data.extend((commands.len() as u32).to_le_bytes());
        data.extend((body.len() as u32).to_le_bytes());
        data.extend(0u32.to_le_bytes()); // flags
        data.extend(0u32.to_le_bytes()); // reserved
        data.extend(body);
        data
    }

    fn load_dylib_command(cmd: u32, path: &str) -> Vec<u8> {
        let padded = (path.len() + 1 + 7) & !7;
        let cmdsize = 24 + padded;
        let mut out = Vec::new();
        out.extend(cmd.to_le_bytes());
        out.extend((cmdsize as u32).to_le_bytes());
        out.extend(24u32.to_le_bytes()); // name offset
        out.extend(2u32.to_le_bytes()); // timestamp
        out.extend(0x0001_0000_u32.to_le_bytes()); // current version
        out.extend(0x0001_0000_u32.to_le_bytes()); // compatibility version
        out.extend(path.as_bytes());
        out.resize(out.len() + padded - path.len(), 0);
        out
    }

    fn encryption_info_command(cryptid: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(LC_ENCRYPTION_INFO_64.to_le_bytes());
        out.extend(24u32.to_le_bytes());
        out.extend(0u32.to_le_bytes()); // cryptoff
        out.extend(0u32.to_le_bytes()); // cryptsize
        out.extend(cryptid.to_le_bytes());
        out.extend(0u32.to_le_bytes()); // pad
        out
    }

    #[test]
    fn recognizes_all_magics() {
        assert!(is_macho(&[0xca, 0xfe, 0xba, 0xbe]));
        assert!(is_macho(&[0xce, 0xfa, 0xed, 0xfe]));
        assert!(is_macho(&[0xcf, 0xfa, 0xed, 0xfe]));
        assert!(is_macho(&[0xfe, 0xed, 0xfa, 0xce]));
        assert!(!is_macho(b"PK\x03\x04"));
    }

    #[test]
    fn reads_dylib_load_commands() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("Demo");
        let image = macho_image(&[
            load_dylib_command(LC_LOAD_DYLIB, "@rpath/Libfoo.framework/Libfoo"),
            load_dylib_command(LC_LOAD_WEAK_DYLIB, "/usr/lib/libSystem.B.dylib"),
        ]);
        fs::write(&bin, image).unwrap();

        let libs = linked_libraries(&bin).unwrap();
        assert_eq!(
            libs,
            vec![
                "@rpath/Libfoo.framework/Libfoo".to_string(),
                "/usr/lib/libSystem.B.dylib".to_string(),
            ]
        );
    }

    #[test]
    fn detects_fairplay_encryption() {
        let dir = tempfile::tempdir().unwrap();

        let clear = dir.path().join("clear");
        fs::write(&clear, macho_image(&[encryption_info_command(0)])).unwrap();
        assert!(!is_encrypted(&clear).unwrap());

        let locked = dir.path().join("locked");
        fs::write(&locked, macho_image(&[encryption_info_command(1)])).unwrap();
        assert!(is_encrypted(&locked).unwrap());
    }

    #[test]
    fn malformed_binary_is_not_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let junk = dir.path().join("junk");
        fs::write(&junk, [0xcf, 0xfa, 0xed, 0xfe, 0x00]).unwrap();
        assert!(!is_encrypted(&junk).unwrap());
    }

    #[test]
    fn unsigned_binary_has_no_entitlements() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bare");
        fs::write(&bin, macho_image(&[])).unwrap();
        assert!(read_entitlements(&bin).unwrap().is_none());
    }

    #[test]
    fn short_file_has_no_magic() {
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("stub");
        fs::write(&stub, [0xca]).unwrap();
        assert!(read_magic(&stub).unwrap().is_none());
    }
}
