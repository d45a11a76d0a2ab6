//! Offset pagination sanitization for list endpoints.
//!
//! Raw query values are sanitized, never reflected: non-numeric, NaN,
//! infinite, and negative inputs collapse to safe defaults, and the served
//! limit always lies in `[1, max_limit]`.

/// Sanitized pagination window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageParams {
    pub limit: i64,
    pub offset: i64,
}

/// Sanitize raw `limit`/`offset` query values.
pub fn sanitize(
    limit_raw: Option<&str>,
    offset_raw: Option<&str>,
    default_limit: i64,
    max_limit: i64,
) -> PageParams {
    let limit = parse_finite(limit_raw)
        .map(|v| v.floor() as i64)
        .unwrap_or(default_limit)
        .clamp(1, max_limit.max(1));

    let offset = parse_finite(offset_raw)
        .map(|v| v.floor() as i64)
        .unwrap_or(0)
        .max(0);

    PageParams { limit, offset }
}

/// Whether more rows exist past the served page.
pub fn has_more(total: u64, offset: i64, returned: usize) -> bool {
    (offset.max(0) as u64).saturating_add(returned as u64) < total
}

fn parse_finite(raw: Option<&str>) -> Option<f64> {
    let value = raw?.trim().parse::<f64>().ok()?;
    value.is_finite().then_some(value)
}
