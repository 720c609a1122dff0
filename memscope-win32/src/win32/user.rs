/*!
User account map built from the loaded user registry hives.

Only the portable resolution path is implemented: SIDs and names are
recovered from hive names and hive values. Resolving well-known SIDs
through the host OS is out of scope for this layer.
*/

use crate::strmap::StrMapBuilder;
use crate::util;
use crate::vmm::Vmm;
use crate::win32::maps::{UserEntry, UserMap};
use crate::win32::unicode::utf16_bytes_to_string;

use log::trace;

use memscope_core::mem::PhysicalMemory;

const REG_SZ: u32 = 1;
const REG_LINK: u32 = 6;

/// Extracts the SID string from a hive name like
/// `0xffff..._ntuserdat_USER_S-1-5-21-...`.
fn sid_from_hive_name(name: &str) -> Option<String> {
    let pos = name.find("-USER_S-")?;
    let sid = &name[pos + 6..];
    if sid.len() < 20 || sid.contains("Classes") {
        return None;
    }
    Some(sid.to_string())
}

/// Extracts the SID string from a `SymbolicLinkValue` REG_LINK blob,
/// e.g. `\Registry\User\S-1-5-21-..._Classes`.
fn sid_from_symlink(raw: &[u8]) -> Option<String> {
    let s = utf16_bytes_to_string(raw);
    let pos = s.find("\\S-")?;
    let sid = &s[pos + 1..];
    if sid.len() < 20 {
        return None;
    }
    let end = sid.find('_').unwrap_or(sid.len());
    Some(sid[..end].to_string())
}

/// Builds the user map from the hive enumeration of the registry
/// engine. Hives that do not look like user hives are skipped.
pub(crate) fn initialize<P: PhysicalMemory>(vmm: &Vmm<P>) -> UserMap {
    let registry = match vmm.registry.as_deref() {
        Some(r) => r,
        None => return UserMap::default(),
    };

    let mut pool = StrMapBuilder::new();
    let mut entries = Vec::new();

    for hive in registry.hives() {
        let name_lower = hive.name.to_ascii_lowercase();
        let f_user = hive.name.contains("-USER_S-");
        let f_ntuserdat = name_lower.contains("-ntuserdat-");
        if !f_user && !f_ntuserdat {
            continue;
        }
        // without a SID in the hive name only "-unknown" ntuser hives
        // are considered
        if !f_user && !name_lower.contains("-unknown") {
            continue;
        }

        // account name from the volatile environment
        let mut user_name = registry
            .hive_value_query(hive.va, "ROOT\\Volatile Environment\\USERNAME")
            .filter(|(tp, _)| *tp == REG_SZ)
            .map(|(_, raw)| utf16_bytes_to_string(&raw))
            .unwrap_or_default();
        // allow a missing USERNAME only on XP era builds
        if user_name.is_empty() && vmm.sysinfo.version_build > 2600 {
            continue;
        }

        // the SID, from the hive name or the class hive symlink
        let mut sid = sid_from_hive_name(&hive.name);
        if sid.is_none() {
            if let Some((tp, raw)) = registry
                .hive_value_query(hive.va, "ROOT\\Software\\Classes\\SymbolicLinkValue")
            {
                if tp == REG_LINK {
                    sid = sid_from_symlink(&raw);
                    if user_name.is_empty() {
                        // XP: derive the name from the symlink path
                        let s = utf16_bytes_to_string(&raw);
                        if let Some(rest) = s.get(10..) {
                            if let Some(end) = rest.find('\\') {
                                user_name = rest[..end].to_string();
                            }
                        }
                    }
                }
            }
        }
        let sid = match sid {
            Some(s) => s,
            None => continue,
        };
        if user_name.is_empty() {
            continue;
        }

        entries.push(UserEntry {
            hash_sid: util::hash32(&sid),
            sid: pool.push(&sid),
            va_reg_hive: hive.va,
            name: pool.push(&user_name),
        });
    }

    trace!("user map: {} accounts", entries.len());
    UserMap {
        entries,
        pool: pool.finish(),
    }
}
