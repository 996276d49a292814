/// Renders a Zipkin numeric id as lowercase hex of its unsigned bit pattern.
pub fn id_to_hex(id: i64) -> String {
    format!("{:x}", id as u64)
}

/// Renders a Thrift trace id, including the upper half of 128-bit ids.
pub fn trace_id_to_hex(high: Option<i64>, low: i64) -> String {
    match high {
        Some(high) if high != 0 => format!("{:016x}{:016x}", high as u64, low as u64),
        _ => id_to_hex(low),
    }
}

/// Numeric form of a textual trace id, used for sampling.
///
/// Only the low 64 bits take part, so a 128-bit id maps to the same number as
/// the Thrift `trace_id` field of that trace. Anything unparseable yields 0.
pub fn numeric_trace_id(trace_id: &str) -> i64 {
    let trimmed = trace_id.trim();
    let low = if trimmed.len() > 16 {
        match trimmed.get(trimmed.len() - 16..) {
            Some(low) => low,
            None => return 0,
        }
    } else {
        trimmed
    };
    u64::from_str_radix(low, 16)
        .map(|v| v as i64)
        .unwrap_or(0)
}

/// An all-zero parent id is the "no parent" sentinel.
pub fn normalize_parent_id(parent_id: &str) -> String {
    if parent_id.bytes().all(|b| b == b'0') {
        String::new()
    } else {
        parent_id.to_string()
    }
}
