/// Returns the URL form `<archive>!/<entry>` used to reference a file
/// stored inside an apk.
pub fn apk_url(apk_path: &str, entry_path: &str) -> String {
    format!("{apk_path}!/{entry_path}")
}

const EXTRACTED_MID: &str = " extracted in memory from ";

/// Recognizes map names of dex files that were extracted from an archive
/// straight into memory, yielding `(archive path, entry path)`.
///
/// Accepted forms:
/// - `[anon:dalvik-classes.dex extracted in memory from /data/app/base.apk]`
/// - `/dev/ashmem/dalvik-classes.dex extracted in memory from /data/app/base.apk (deleted)`
/// - `/data/app/base.apk!classes2.dex`
pub fn parse_extracted_in_memory_path(map_name: &str) -> Option<(String, String)> {
    for (prefix, suffix) in [("[anon:dalvik-", "]"), ("/dev/ashmem/dalvik-", "")] {
        let Some(rest) = map_name.strip_prefix(prefix) else {
            continue;
        };
        let rest = rest.strip_suffix(" (deleted)").unwrap_or(rest);
        let rest = if suffix.is_empty() {
            rest
        } else {
            rest.strip_suffix(suffix)?
        };
        let mid = rest.find(EXTRACTED_MID)?;
        let entry_path = &rest[..mid];
        let apk_path = &rest[mid + EXTRACTED_MID.len()..];
        if entry_path.is_empty() || apk_path.is_empty() {
            return None;
        }
        return Some((apk_path.to_string(), entry_path.to_string()));
    }
    // The compact form names the apk directly, with the entry after '!'.
    if let Some((apk_path, entry_path)) = map_name.split_once('!') {
        if apk_path.ends_with(".apk") && !entry_path.is_empty() {
            let entry_path = entry_path.strip_prefix('/').unwrap_or(entry_path);
            return Some((apk_path.to_string(), entry_path.to_string()));
        }
    }
    None
}
