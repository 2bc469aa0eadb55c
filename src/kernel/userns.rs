/// User namespace id mapping
///
/// The map files can only be written from outside the new namespace, so the
/// parent calls `write_id_maps` between clone and the release byte. In an
/// unprivileged user namespace the kernel refuses gid_map writes until
/// setgroups has been denied, hence the strict ordering here.
use crate::config::types::{IdMap, UserNsConfig};
use crate::types::{Result, RuntimeError};
use nix::unistd::{setgid, setuid, Gid, Pid, Uid};
use std::fs;

/// Write setgroups, uid_map and gid_map for a freshly cloned child.
/// Order matters: setgroups=deny must precede the gid_map write.
pub fn write_id_maps(child: Pid, config: &UserNsConfig) -> Result<()> {
    write_proc_file(child, "setgroups", "deny")?;
    write_proc_file(child, "uid_map", &render_maps(&config.uid_maps))?;
    write_proc_file(child, "gid_map", &render_maps(&config.gid_maps))?;
    log::debug!(
        "id maps written for PID {}: {} uid entries, {} gid entries",
        child,
        config.uid_maps.len(),
        config.gid_maps.len()
    );
    Ok(())
}

/// Switch the child to its configured credentials; GID before UID, since a
/// process that has already dropped its UID may not change groups anymore.
pub fn drop_to_user(uid: u32, gid: u32) -> Result<()> {
    setgid(Gid::from_raw(gid))
        .map_err(|e| RuntimeError::UserNs(format!("setgid({}) failed: {}", gid, e)))?;
    setuid(Uid::from_raw(uid))
        .map_err(|e| RuntimeError::UserNs(format!("setuid({}) failed: {}", uid, e)))?;
    Ok(())
}

/// Render map entries as newline-terminated "<inner> <outer> <count>" triples
fn render_maps(maps: &[IdMap]) -> String {
    let mut out = String::new();
    for map in maps {
        out.push_str(&format!("{} {} {}\n", map.inner, map.outer, map.count));
    }
    out
}

fn write_proc_file(child: Pid, file: &str, content: &str) -> Result<()> {
    let path = format!("/proc/{}/{}", child, file);
    fs::write(&path, content)
        .map_err(|e| RuntimeError::UserNs(format!("could not write {}: {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_render_as_space_separated_triples() {
        let maps = [
            IdMap { inner: 0, outer: 1000, count: 1 },
            IdMap { inner: 1, outer: 100000, count: 65536 },
        ];
        assert_eq!(render_maps(&maps), "0 1000 1\n1 100000 65536\n");
    }

    #[test]
    fn empty_maps_render_empty() {
        assert_eq!(render_maps(&[]), "");
    }
}
