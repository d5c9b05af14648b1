//! Mounted volume enumeration from /proc/mounts plus statvfs.

use serde::Serialize;

/// Filesystem types that live in RAM or carry no user data.
const SKIPPED_FSTYPES: &[&str] = &[
    "autofs", "bpf", "cgroup", "cgroup2", "configfs", "debugfs", "devpts", "devtmpfs", "efivarfs",
    "fusectl", "hugetlbfs", "mqueue", "overlay", "proc", "pstore", "ramfs", "securityfs",
    "squashfs", "sysfs", "tmpfs", "tracefs",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub path: String,
    pub capacity: u64,
    pub free_space: u64,
    pub mounted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MountEntry {
    pub device: String,
    pub mount_point: String,
    pub fstype: String,
}

/// Parse `/proc/mounts`, dropping pseudo and RAM-backed filesystems.
pub fn parse_mounts(text: &str) -> Vec<MountEntry> {
    let mut mounts = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        if SKIPPED_FSTYPES.contains(&fields[2]) {
            continue;
        }
        mounts.push(MountEntry {
            device: fields[0].to_string(),
            // Octal escapes (\040 for spaces) appear in mount points.
            mount_point: unescape(fields[1]),
            fstype: fields[2].to_string(),
        });
    }
    mounts
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.by_ref().take(3).collect();
        match u8::from_str_radix(&digits, 8) {
            Ok(byte) => out.push(byte as char),
            Err(_) => {
                out.push('\\');
                out.push_str(&digits);
            }
        }
    }
    out
}

/// Enumerate mounted volumes with a positive total size.
pub fn enumerate() -> Vec<Volume> {
    let Ok(text) = std::fs::read_to_string("/proc/mounts") else {
        return Vec::new();
    };
    let mut volumes = Vec::new();
    for mount in parse_mounts(&text) {
        let Ok(stats) = nix::sys::statvfs::statvfs(mount.mount_point.as_str()) else {
            continue;
        };
        let capacity = stats.blocks() as u64 * stats.fragment_size() as u64;
        if capacity == 0 {
            continue;
        }
        let free_space = stats.blocks_available() as u64 * stats.fragment_size() as u64;
        volumes.push(Volume {
            name: mount.device,
            path: mount.mount_point,
            capacity,
            free_space,
            mounted: true,
        });
    }
    volumes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_filesystems_are_skipped() {
        let text = "\
proc /proc proc rw 0 0
sysfs /sys sysfs rw 0 0
/dev/mmcblk0p2 / ext4 rw,noatime 0 0
tmpfs /run tmpfs rw 0 0
/dev/sda1 /mnt/usb vfat rw 0 0
";
        let mounts = parse_mounts(text);
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].mount_point, "/");
        assert_eq!(mounts[1].fstype, "vfat");
    }

    #[test]
    fn escaped_mount_points_are_decoded() {
        let text = "/dev/sda1 /mnt/usb\\040drive vfat rw 0 0\n";
        let mounts = parse_mounts(text);
        assert_eq!(mounts[0].mount_point, "/mnt/usb drive");
    }
}
