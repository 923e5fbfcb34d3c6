//! Unicast device seeding from `devices.ini`
//!
//! The `[ELUDP]` section lists devices reachable only by address, one option
//! per device, its value a comma-separated `key=value` list. Only `ip` is
//! required; `port` defaults to 1775. Anything unparseable is tolerated.

use crate::device::Device;
use crate::eludp::{ElUdp, ELUDP_PORT};
use crate::inventory::Inventory;
use configparser::ini::Ini;
use std::net::Ipv4Addr;
use std::path::Path;

const SEED_SECTION: &str = "eludp";

/// Load seed entries, appending a unicast-only device per entry.
/// Returns how many devices were added.
pub fn load_seed(path: impl AsRef<Path>, inventory: &Inventory, eludp: Option<&ElUdp>) -> usize {
    let path = path.as_ref();
    let mut ini = Ini::new();
    let map = match ini.load(path) {
        Ok(map) => map,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "no device seed loaded");
            return 0;
        }
    };
    let Some(section) = map.get(SEED_SECTION) else {
        tracing::debug!(path = %path.display(), "seed file has no [ELUDP] section");
        return 0;
    };

    let mut count = 0;
    for (name, value) in section {
        let Some(value) = value else { continue };
        match parse_entry(value) {
            Some((ip, port)) => {
                tracing::info!(entry = %name, %ip, port, "seeding unicast device");
                inventory.append(Device::from_addr(ip, port, eludp.cloned()));
                count += 1;
            }
            None => {
                tracing::warn!(entry = %name, "ignoring malformed seed entry");
            }
        }
    }
    count
}

fn parse_entry(value: &str) -> Option<(Ipv4Addr, u16)> {
    let mut ip = None;
    let mut port = ELUDP_PORT;
    for token in value.split(',') {
        let (key, val) = token.split_once('=')?;
        match key.trim() {
            "ip" => ip = Some(val.trim().parse().ok()?),
            "port" => port = val.trim().parse().ok()?,
            _ => {}
        }
    }
    Some((ip?, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    struct TempSeed(PathBuf);

    impl TempSeed {
        fn new(name: &str, contents: &str) -> Self {
            let path = std::env::temp_dir().join(format!("dsu-seed-{}-{name}", std::process::id()));
            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(contents.as_bytes()).unwrap();
            Self(path)
        }
    }

    impl Drop for TempSeed {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn test_parse_entry_values() {
        assert_eq!(
            parse_entry("ip=192.168.0.120, port=1776"),
            Some((Ipv4Addr::new(192, 168, 0, 120), 1776))
        );
        assert_eq!(
            parse_entry("ip=10.0.0.1"),
            Some((Ipv4Addr::new(10, 0, 0, 1), ELUDP_PORT))
        );
        assert_eq!(parse_entry("port=1776"), None);
        assert_eq!(parse_entry("ip=not-an-ip"), None);
        assert_eq!(parse_entry("garbage"), None);
    }

    #[test]
    fn test_seed_appends_unicast_devices() {
        let seed = TempSeed::new(
            "ok",
            "[ELUDP]\n\
             dev1 : ip=192.168.0.120, port=1776\n\
             dev2 : ip=192.168.0.121\n",
        );
        let inventory = Inventory::new();
        assert_eq!(load_seed(&seed.0, &inventory, None), 2);
        assert_eq!(inventory.len(), 2);

        let devices = inventory.devices();
        let mut addrs: Vec<_> = devices.iter().map(|d| d.addr()).collect();
        addrs.sort();
        assert_eq!(
            addrs,
            vec![
                (Ipv4Addr::new(192, 168, 0, 120), 1776),
                (Ipv4Addr::new(192, 168, 0, 121), ELUDP_PORT),
            ]
        );
        assert!(devices.iter().all(|d| d.serial().is_empty()));
    }

    #[test]
    fn test_seed_tolerates_garbage() {
        let seed = TempSeed::new(
            "garbage",
            "[ELUDP]\n\
             bad1 : port=1776\n\
             bad2 : ip=not-an-ip\n\
             good : ip=10.0.0.7\n",
        );
        let inventory = Inventory::new();
        assert_eq!(load_seed(&seed.0, &inventory, None), 1);
        assert_eq!(inventory.len(), 1);
    }

    #[test]
    fn test_missing_file_and_section_seed_nothing() {
        let inventory = Inventory::new();
        assert_eq!(
            load_seed("/nonexistent/devices.ini", &inventory, None),
            0
        );

        let seed = TempSeed::new("nosec", "[OTHER]\nx : ip=10.0.0.1\n");
        assert_eq!(load_seed(&seed.0, &inventory, None), 0);
        assert!(inventory.is_empty());
    }
}
