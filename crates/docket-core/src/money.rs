//! Money and duration value helpers.
//!
//! All monetary amounts in docket are integer cents and all durations are
//! integer minutes, so stored and computed values compare exactly. These
//! helpers centralize the charge arithmetic and the display formatting used
//! in enforcement reason strings.

/// Format cents as a decimal dollar string: `12345` -> `"123.45"`.
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// Format minutes as decimal hours with up to two places, trailing zeros
/// trimmed: `570` -> `"9.5"`, `600` -> `"10"`, `50` -> `"0.83"`.
pub fn format_minutes_as_hours(minutes: i64) -> String {
    let sign = if minutes < 0 { "-" } else { "" };
    let abs = minutes.unsigned_abs();
    // Hundredths of an hour, rounded to nearest.
    let hundredths = (abs * 100 + 30) / 60;
    let whole = hundredths / 100;
    let frac = hundredths % 100;
    if frac == 0 {
        format!("{sign}{whole}")
    } else if frac % 10 == 0 {
        format!("{sign}{whole}.{}", frac / 10)
    } else {
        format!("{sign}{whole}.{frac:02}")
    }
}

/// Charge for tracked time: rate is cents per hour, duration is minutes.
/// Rounded to the nearest cent.
pub fn time_charge_cents(rate_cents_per_hour: i64, minutes: i64) -> i64 {
    (rate_cents_per_hour * minutes + 30) / 60
}

/// Charge for a quantity of units at a unit rate.
pub fn quantity_charge_cents(rate_cents: i64, quantity: i64) -> i64 {
    rate_cents * quantity
}
