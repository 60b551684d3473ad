use std::borrow::Cow;

/// Port assumed for backend addresses that omit one.
pub const DEFAULT_MINECRAFT_PORT: u16 = 25565;

/// Normalize a bind/listen address.
///
/// Config files commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". `SocketAddr` parsing and Tokio bind APIs do not accept
/// `":PORT"`, so it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Whether `addr` lacks an explicit port.
///
/// Bracketed IPv6 (`[::1]:25565`) is checked for the `]:` suffix; a bare IPv6
/// literal (more than one colon, no brackets) is treated as host-only.
pub fn needs_port(addr: &str) -> bool {
    let addr = addr.trim();
    if addr.starts_with('[') {
        return !addr.contains("]:");
    }
    match addr.matches(':').count() {
        0 => true,
        1 => false,
        _ => true,
    }
}

/// Append the default Minecraft port when `addr` has none.
pub fn with_default_port(addr: &str) -> String {
    let addr = addr.trim();
    if !needs_port(addr) {
        return addr.to_string();
    }
    if addr.contains(':') && !addr.starts_with('[') {
        format!("[{addr}]:{DEFAULT_MINECRAFT_PORT}")
    } else {
        format!("{addr}:{DEFAULT_MINECRAFT_PORT}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":25565").as_ref(), "0.0.0.0:25565");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:25565").as_ref(),
            "127.0.0.1:25565"
        );
        assert_eq!(normalize_bind_addr("[::]:25565").as_ref(), "[::]:25565");
    }

    #[test]
    fn default_port_is_appended_only_when_missing() {
        assert_eq!(with_default_port("mc.internal"), "mc.internal:25565");
        assert_eq!(with_default_port("10.0.0.2:25570"), "10.0.0.2:25570");
        assert_eq!(with_default_port("[::1]:25570"), "[::1]:25570");
        assert_eq!(with_default_port("[::1]"), "[::1]:25565");
        assert_eq!(with_default_port("::1"), "[::1]:25565");
    }
}
