//! Symbol canonicalization and unit conversion helpers.
//!
//! CN codes are 6 digits, zero-padded; the exchange-suffixed `full_symbol`
//! is derived from the code prefix. Vendors disagree on units: these
//! helpers put everything on the canonical footing (market cap in 亿元,
//! volume in shares, amounts in yuan).

/// Zero-pad a CN numeric code to 6 characters. Non-numeric codes
/// (HK/US tickers) pass through trimmed and uppercased.
pub fn canonicalize_code(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().all(|c| c.is_ascii_digit()) && !trimmed.is_empty() && trimmed.len() <= 6 {
        format!("{trimmed:0>6}")
    } else {
        trimmed.to_uppercase()
    }
}

/// Derive the exchange-suffixed symbol from a canonical CN code.
/// Unrecognized prefixes return the code unchanged.
pub fn full_symbol_for(code: &str) -> String {
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
        return code.to_string();
    }
    if code.starts_with("60") || code.starts_with("68") || code.starts_with("90") {
        format!("{code}.SS")
    } else if code.starts_with("00") || code.starts_with("30") || code.starts_with("20") {
        format!("{code}.SZ")
    } else if code.starts_with('8') || code.starts_with('4') {
        format!("{code}.BJ")
    } else {
        code.to_string()
    }
}

/// Strip a `ts_code`-style suffixed symbol (`600000.SH`) down to the bare
/// 6-char code. Already-bare codes pass through canonicalized.
pub fn code_from_suffixed(symbol: &str) -> String {
    match symbol.split_once('.') {
        Some((code, _)) => canonicalize_code(code),
        None => canonicalize_code(symbol),
    }
}

/// Yuan to 亿元 (100M yuan).
pub fn yuan_to_yi(yuan: f64) -> f64 {
    yuan / 1e8
}

/// 万元 (10k yuan, the tushare market-cap unit) to 亿元.
pub fn wan_to_yi(wan: f64) -> f64 {
    wan / 1e4
}

/// 手 (lots of 100 shares, common in CN feeds) to shares.
pub fn lots_to_shares(lots: f64) -> f64 {
    lots * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cn_codes_zero_padded() {
        assert_eq!(canonicalize_code("1"), "000001");
        assert_eq!(canonicalize_code("600000"), "600000");
        assert_eq!(canonicalize_code(" 300750 "), "300750");
    }

    #[test]
    fn non_numeric_codes_pass_through() {
        assert_eq!(canonicalize_code("aapl"), "AAPL");
        assert_eq!(canonicalize_code("0700.HK"), "0700.HK");
    }

    #[test]
    fn full_symbol_prefix_rules() {
        assert_eq!(full_symbol_for("600000"), "600000.SS");
        assert_eq!(full_symbol_for("688981"), "688981.SS");
        assert_eq!(full_symbol_for("900901"), "900901.SS");
        assert_eq!(full_symbol_for("000001"), "000001.SZ");
        assert_eq!(full_symbol_for("300750"), "300750.SZ");
        assert_eq!(full_symbol_for("200011"), "200011.SZ");
        assert_eq!(full_symbol_for("830799"), "830799.BJ");
        assert_eq!(full_symbol_for("430047"), "430047.BJ");
        // Unrecognized prefix stays bare.
        assert_eq!(full_symbol_for("700001"), "700001");
    }

    #[test]
    fn suffixed_symbols_stripped() {
        assert_eq!(code_from_suffixed("600000.SH"), "600000");
        assert_eq!(code_from_suffixed("000001.SZ"), "000001");
        assert_eq!(code_from_suffixed("600000"), "600000");
    }

    #[test]
    fn unit_conversions() {
        assert_eq!(yuan_to_yi(2.5e8), 2.5);
        assert_eq!(wan_to_yi(1_0000.0), 1.0);
        assert_eq!(lots_to_shares(15.0), 1500.0);
    }
}
