/// Kind of quantity a value expressed, after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Size,
    Time,
    Unrecognized,
}

const SIZE_UNITS: &[(u64, &[&str])] = &[
    (1, &["b", "byte", "bytes"]),
    (1 << 10, &["kb", "kbyte", "kbytes", "kilobyte", "kilobytes", "kib"]),
    (1 << 20, &["mb", "mbyte", "mbytes", "megabyte", "megabytes", "mib"]),
    (1 << 30, &["gb", "gbyte", "gbytes", "gigabyte", "gigabytes", "gib"]),
    (1 << 40, &["tb", "tbyte", "tbytes", "terabyte", "terabytes", "tib"]),
];

const TIME_UNITS: &[(u64, &[&str])] = &[
    (1, &["sec", "secs", "second", "seconds"]),
    (60, &["min", "mins", "minute", "minutes"]),
    (3_600, &["hour", "hours"]),
    (86_400, &["day", "days"]),
    (604_800, &["week", "weeks"]),
];

fn lookup(unit: &str) -> Option<(u64, UnitKind)> {
    let unit = unit.to_ascii_lowercase();
    let find = |table: &[(u64, &[&str])]| {
        table
            .iter()
            .find(|(_, labels)| labels.contains(&unit.as_str()))
            .map(|(mult, _)| *mult)
    };

    find(SIZE_UNITS)
        .map(|m| (m, UnitKind::Size))
        .or_else(|| find(TIME_UNITS).map(|m| (m, UnitKind::Time)))
}

/// Expand `<number> <unit>` sizes and durations into bytes or seconds, the
/// form the daemon reports them in. Other values come back unchanged.
pub fn normalize(value: &str) -> (String, UnitKind) {
    let mut parts = value.split_whitespace();
    if let (Some(number), Some(unit), None) = (parts.next(), parts.next(), parts.next()) {
        if let (Ok(n), Some((mult, kind))) = (number.parse::<u64>(), lookup(unit)) {
            if let Some(total) = n.checked_mul(mult) {
                return (total.to_string(), kind);
            }
        }
    }
    (value.to_string(), UnitKind::Unrecognized)
}
