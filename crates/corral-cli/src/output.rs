//! Human-readable byte sizes for CLI input and output.

/// Formats a byte count into a human-readable string (e.g., "128.0 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Parses a size such as `512`, `64k`, `256m` or `2g` (binary multiples,
/// optional trailing `b`).
///
/// # Errors
///
/// Returns a message suitable for clap if the size is malformed or
/// overflows.
pub fn parse_bytes(input: &str) -> Result<u64, String> {
    let lower = input.trim().to_ascii_lowercase();
    let trimmed = lower.strip_suffix('b').unwrap_or(&lower);
    let (digits, shift) = match trimmed.as_bytes().last() {
        Some(b'k') => (&trimmed[..trimmed.len() - 1], 10),
        Some(b'm') => (&trimmed[..trimmed.len() - 1], 20),
        Some(b'g') => (&trimmed[..trimmed.len() - 1], 30),
        _ => (trimmed, 0),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size {input:?}"))?;
    value
        .checked_mul(1 << shift)
        .ok_or_else(|| format!("size {input:?} is too large"))
}
