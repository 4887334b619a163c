use std::borrow::Cow;

pub fn join(base: &str, name: &str) -> String {
    let base = base.trim();
    let name = name.trim();
    if name.is_empty() {
        return base.to_string();
    }
    if name.starts_with('/') {
        return name.to_string();
    }
    if base.is_empty() || base == "." {
        return name.to_string();
    }
    if base == "/" {
        return format!("/{name}");
    }
    format!("{}/{}", base.trim_end_matches('/'), name)
}

pub fn parent(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path == "." || path == "/" {
        return "/".to_string();
    }
    let trimmed = path.trim_end_matches('/');
    if let Some((parent, _)) = trimmed.rsplit_once('/') {
        if parent.is_empty() {
            "/".to_string()
        } else {
            parent.to_string()
        }
    } else {
        ".".to_string()
    }
}

pub fn basename(path: &str) -> &str {
    let trimmed = path.trim().trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, name)) => name,
        None => trimmed,
    }
}

/// Absolute, slash-collapsed form without a trailing slash (`/` stays `/`).
pub fn normalize(path: &str) -> String {
    let parts = components(path);
    if parts.is_empty() {
        return "/".to_string();
    }
    format!("/{}", parts.join("/"))
}

/// Segments with `.` dropped and `..` applied. `..` never climbs above the root.
pub fn components(path: &str) -> Vec<&str> {
    let mut out = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            name => out.push(name),
        }
    }
    out
}

/// Absolute form of `path`; relative paths start from `home`.
pub fn resolve(home: &str, path: &str) -> String {
    let path = path.trim();
    if path.starts_with('/') {
        normalize(path)
    } else {
        normalize(&join(home, path))
    }
}

/// `/a/b/c` -> `["/", "/a", "/a/b", "/a/b/c"]`.
pub fn ancestors_inclusive(path: &str) -> Vec<String> {
    let mut out = vec!["/".to_string()];
    let mut current = String::new();
    for part in components(path) {
        current.push('/');
        current.push_str(part);
        out.push(current.clone());
    }
    out
}

pub fn quote(arg: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(arg))
}

pub fn size_label(size: u64) -> String {
    const UNITS: [(&str, u64); 4] = [
        ("TB", 1 << 40),
        ("GB", 1 << 30),
        ("MB", 1 << 20),
        ("KB", 1 << 10),
    ];
    for (unit, scale) in UNITS {
        if size >= scale {
            return format!("{:.1} {unit}", size as f64 / scale as f64);
        }
    }
    format!("{size} B")
}

pub fn modified_label(mtime: Option<u32>) -> String {
    let Some(unix) = mtime else {
        return "-".to_string();
    };
    let Ok(dt) = time::OffsetDateTime::from_unix_timestamp(i64::from(unix)) else {
        return format!("{unix}");
    };
    let format = time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    dt.format(&format).unwrap_or_else(|_| format!("{unix}"))
}

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFLNK: u32 = 0o120_000;

/// `ls -l` style mode string, e.g. `drwxr-xr-x`.
pub fn permission_string(mode: u32) -> String {
    let kind = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        0o020_000 => 'c',
        0o060_000 => 'b',
        0o010_000 => 'p',
        0o140_000 => 's',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    let bits = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ];
    for (i, (bit, ch)) in bits.iter().enumerate() {
        let set = mode & bit != 0;
        let c = match (i, set) {
            (2, true) if mode & 0o4000 != 0 => 's',
            (2, false) if mode & 0o4000 != 0 => 'S',
            (5, true) if mode & 0o2000 != 0 => 's',
            (5, false) if mode & 0o2000 != 0 => 'S',
            (8, true) if mode & 0o1000 != 0 => 't',
            (8, false) if mode & 0o1000 != 0 => 'T',
            (_, true) => *ch,
            (_, false) => '-',
        };
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_parent_handle_root_and_relative() {
        assert_eq!(join("/", "etc"), "/etc");
        assert_eq!(join("/var/log/", "syslog"), "/var/log/syslog");
        assert_eq!(join("/var", "/abs"), "/abs");
        assert_eq!(join(".", "rel"), "rel");
        assert_eq!(parent("/x/old"), "/x");
        assert_eq!(parent("/x"), "/");
        assert_eq!(parent("/"), "/");
        assert_eq!(parent("file"), ".");
    }

    #[test]
    fn basename_ignores_trailing_slash() {
        assert_eq!(basename("/a/b/c/"), "c");
        assert_eq!(basename("plain"), "plain");
    }

    #[test]
    fn ancestors_start_at_root() {
        assert_eq!(
            ancestors_inclusive("/a/b/c"),
            vec!["/", "/a", "/a/b", "/a/b/c"]
        );
        assert_eq!(ancestors_inclusive("/"), vec!["/"]);
        assert_eq!(normalize("//a//b/./"), "/a/b");
    }

    #[test]
    fn dot_dot_is_applied_and_stops_at_root() {
        assert_eq!(normalize("/a/../b"), "/b");
        assert_eq!(normalize("/a/b/../../c/./d"), "/c/d");
        assert_eq!(normalize("/.."), "/");
        assert_eq!(normalize("/../../etc"), "/etc");
    }

    #[test]
    fn relative_paths_resolve_against_home() {
        assert_eq!(resolve("/home/me", "docs/a.txt"), "/home/me/docs/a.txt");
        assert_eq!(resolve("/home/me", "../other"), "/home/other");
        assert_eq!(resolve("/home/me", "."), "/home/me");
        assert_eq!(resolve("/home/me", ""), "/home/me");
        assert_eq!(resolve("/home/me", "/srv//www/"), "/srv/www");
    }

    #[test]
    fn quote_wraps_unsafe_arguments() {
        assert_eq!(quote("/tmp/plain"), "/tmp/plain");
        assert_eq!(quote("/tmp/with space"), "'/tmp/with space'");
    }

    #[test]
    fn size_label_uses_binary_units() {
        assert_eq!(size_label(512), "512 B");
        assert_eq!(size_label(1536), "1.5 KB");
        assert_eq!(size_label(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn modified_label_is_utc() {
        assert_eq!(modified_label(Some(0)), "1970-01-01 00:00:00");
        assert_eq!(modified_label(None), "-");
    }

    #[test]
    fn permission_string_matches_ls() {
        assert_eq!(permission_string(0o040_755), "drwxr-xr-x");
        assert_eq!(permission_string(0o100_644), "-rw-r--r--");
        assert_eq!(permission_string(0o120_777), "lrwxrwxrwx");
        assert_eq!(permission_string(0o104_755), "-rwsr-xr-x");
        assert_eq!(permission_string(0o041_777), "drwxrwxrwt");
    }
}
