// ABOUTME: Binary NUMERIC wire format for arbitrary-precision decimals
// ABOUTME: Converts between BigDecimal and PostgreSQL's base-10000 digit groups

use std::str::FromStr;

use bigdecimal::BigDecimal;
use bytes::{BufMut, BytesMut};

use super::types::BoxError;

/// Decimal digits per NUMERIC digit group.
const GROUP_DIGITS: usize = 4;
const GROUP_BASE: u16 = 10_000;

const SIGN_POSITIVE: u16 = 0x0000;
const SIGN_NEGATIVE: u16 = 0x4000;
const SIGN_NAN: u16 = 0xC000;

/// Largest display scale the binary format can carry.
const MAX_DSCALE: usize = 0x3FFF;

/// Write `value` as a binary NUMERIC without losing digits or scale.
pub(crate) fn write_numeric(value: &BigDecimal, out: &mut BytesMut) -> Result<(), BoxError> {
    let text = value.to_plain_string();
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.as_str()),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if frac_part.len() > MAX_DSCALE {
        return Err(format!("{} has too many fractional digits for NUMERIC", value).into());
    }
    let int_part = int_part.trim_start_matches('0');

    // Align both parts on group boundaries around the decimal point.
    let int_pad = (GROUP_DIGITS - int_part.len() % GROUP_DIGITS) % GROUP_DIGITS;
    let frac_pad = (GROUP_DIGITS - frac_part.len() % GROUP_DIGITS) % GROUP_DIGITS;
    let mut aligned = String::with_capacity(int_pad + unsigned.len() + frac_pad);
    aligned.extend(std::iter::repeat('0').take(int_pad));
    aligned.push_str(int_part);
    aligned.push_str(frac_part);
    aligned.extend(std::iter::repeat('0').take(frac_pad));

    let mut groups: Vec<u16> = aligned
        .as_bytes()
        .chunks(GROUP_DIGITS)
        .map(|chunk| chunk.iter().fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0')))
        .collect();
    let mut weight = ((int_pad + int_part.len()) / GROUP_DIGITS) as i64 - 1;

    let leading = groups.iter().take_while(|g| **g == 0).count();
    groups.drain(..leading);
    weight -= leading as i64;
    while groups.last() == Some(&0) {
        groups.pop();
    }

    let (weight, sign) = if groups.is_empty() {
        (0, SIGN_POSITIVE)
    } else if negative {
        (weight, SIGN_NEGATIVE)
    } else {
        (weight, SIGN_POSITIVE)
    };
    let out_of_range = || -> BoxError { format!("{} is out of range for NUMERIC", value).into() };
    let ndigits = i16::try_from(groups.len()).map_err(|_| out_of_range())?;
    let weight = i16::try_from(weight).map_err(|_| out_of_range())?;

    out.reserve(8 + 2 * groups.len());
    out.put_i16(ndigits);
    out.put_i16(weight);
    out.put_u16(sign);
    out.put_u16(frac_part.len() as u16);
    for group in groups {
        out.put_u16(group);
    }
    Ok(())
}

/// Read a binary NUMERIC, keeping every digit and the column's display scale.
pub(crate) fn read_numeric(raw: &[u8]) -> Result<BigDecimal, BoxError> {
    if raw.len() < 8 || raw.len() % 2 != 0 {
        return Err("invalid NUMERIC value: truncated header".into());
    }
    let word = |i: usize| u16::from_be_bytes([raw[2 * i], raw[2 * i + 1]]);

    let ndigits = word(0) as i16;
    let weight = i64::from(word(1) as i16);
    let sign = word(2);
    let dscale = i64::from(word(3));

    match sign {
        SIGN_POSITIVE | SIGN_NEGATIVE => {}
        SIGN_NAN => return Err("NUMERIC NaN cannot be represented as a number".into()),
        _ => return Err("infinite NUMERIC values cannot be represented as a number".into()),
    }
    if ndigits < 0 || raw.len() != 8 + 2 * ndigits as usize {
        return Err("invalid NUMERIC value: digit count does not match length".into());
    }

    let mut text = String::with_capacity(2 + GROUP_DIGITS * ndigits as usize + 8);
    if sign == SIGN_NEGATIVE {
        text.push('-');
    }
    if ndigits == 0 {
        text.push('0');
    }
    for i in 0..ndigits as usize {
        let group = word(4 + i);
        if group >= GROUP_BASE {
            return Err(format!("invalid NUMERIC digit group {}", group).into());
        }
        text.push_str(&format!("{:04}", group));
    }
    // The last group holds the 10000^(weight - ndigits + 1) place.
    let exponent = GROUP_DIGITS as i64 * (weight - i64::from(ndigits) + 1);
    text.push_str(&format!("e{}", exponent));

    Ok(BigDecimal::from_str(&text)?.with_scale(dscale))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decimal(text: &str) -> BigDecimal {
        text.parse().unwrap()
    }

    fn encode(text: &str) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_numeric(&decimal(text), &mut buf).unwrap();
        buf.to_vec()
    }

    fn words(values: &[u16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    #[test]
    fn test_write_numeric_layout() {
        // 12345.678 -> groups 1 2345 6780, weight 1, dscale 3
        assert_eq!(encode("12345.678"), words(&[3, 1, SIGN_POSITIVE, 3, 1, 2345, 6780]));
        assert_eq!(encode("-0.0045"), words(&[1, 0xFFFF, SIGN_NEGATIVE, 4, 45]));
        assert_eq!(encode("1200000000"), words(&[1, 2, SIGN_POSITIVE, 0, 12]));
    }

    #[test]
    fn test_write_zero_keeps_scale() {
        assert_eq!(encode("0.00"), words(&[0, 0, SIGN_POSITIVE, 2]));
        assert_eq!(encode("-0"), words(&[0, 0, SIGN_POSITIVE, 0]));
    }

    #[test]
    fn test_read_numeric_layout() {
        let value = read_numeric(&words(&[3, 1, SIGN_POSITIVE, 3, 1, 2345, 6780])).unwrap();
        assert_eq!(value.to_plain_string(), "12345.678");

        let value = read_numeric(&words(&[1, 0xFFFF, SIGN_NEGATIVE, 4, 45])).unwrap();
        assert_eq!(value.to_plain_string(), "-0.0045");

        let value = read_numeric(&words(&[0, 0, SIGN_POSITIVE, 2])).unwrap();
        assert_eq!(value.to_plain_string(), "0.00");
    }

    #[test]
    fn test_precision_beyond_28_digits_survives() {
        for text in [
            "0.123456789012345678901234567891",
            "123456789012345678901234567890123456",
            "-98765432109876543210.98765432109876543210",
        ] {
            let mut buf = BytesMut::new();
            write_numeric(&decimal(text), &mut buf).unwrap();
            assert_eq!(read_numeric(&buf).unwrap().to_plain_string(), text);
        }
    }

    #[test]
    fn test_read_rejects_special_values() {
        assert!(read_numeric(&words(&[0, 0, SIGN_NAN, 0])).is_err());
        assert!(read_numeric(&words(&[0, 0, 0xD000, 0])).is_err());
        assert!(read_numeric(&words(&[2, 0, SIGN_POSITIVE, 0, 1])).is_err());
        assert!(read_numeric(&[0, 1]).is_err());
    }
}
