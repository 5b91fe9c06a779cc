/// Formats a KB/s figure, switching to MB/s and GB/s at 1024 boundaries.
pub fn format_speed(kbps: f64) -> String {
    if !kbps.is_finite() || kbps < 0.0 {
        return "0.00 KB/s".to_string();
    }
    if kbps < 1024.0 {
        format!("{kbps:.2} KB/s")
    } else if kbps < 1024.0 * 1024.0 {
        format!("{:.2} MB/s", kbps / 1024.0)
    } else {
        format!("{:.2} GB/s", kbps / (1024.0 * 1024.0))
    }
}

pub fn format_bytes(bytes: u64) -> String {
    let kb = bytes as f64 / 1024.0;
    if kb < 1024.0 {
        format!("{kb:.2} KB")
    } else if kb < 1024.0 * 1024.0 {
        format!("{:.2} MB", kb / 1024.0)
    } else {
        format!("{:.2} GB", kb / (1024.0 * 1024.0))
    }
}
