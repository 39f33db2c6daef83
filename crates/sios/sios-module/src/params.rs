//! Typed parameter setters. Configuration hands modules raw string
//! values; these parse them into the module's own fields. Integer
//! parsing follows `strtol` base-0 rules (leading `0x` is hex, a
//! leading `0` is octal). All setters report pass/fail and never
//! panic.

#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("cannot parse '{value}'")]
    Parse { value: String },

    #[error("string '{value}' does not fit in {max} bytes")]
    Overflow { value: String, max: usize },

    #[error("unknown parameter '{0}'")]
    Unknown(String),
}

fn parse_integer(val: &str) -> Option<i128> {
    let s = val.trim();
    let (negative, rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (radix, digits) = if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        (16, hex)
    } else if rest.len() > 1 && rest.starts_with('0') {
        (8, &rest[1..])
    } else {
        (10, rest)
    };
    let magnitude = i128::from_str_radix(digits, radix).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

macro_rules! int_setter {
    ($name:ident, $ty:ty) => {
        pub fn $name(target: &mut $ty, val: &str) -> Result<(), ParamError> {
            let parsed = parse_integer(val).ok_or_else(|| ParamError::Parse {
                value: val.to_string(),
            })?;
            *target = <$ty>::try_from(parsed).map_err(|_| ParamError::Parse {
                value: val.to_string(),
            })?;
            Ok(())
        }
    };
}

int_setter!(set_i8, i8);
int_setter!(set_u8, u8);
int_setter!(set_i16, i16);
int_setter!(set_u16, u16);
int_setter!(set_i32, i32);
int_setter!(set_u32, u32);
int_setter!(set_i64, i64);
int_setter!(set_u64, u64);

pub fn set_f32(target: &mut f32, val: &str) -> Result<(), ParamError> {
    let wide: f64 = val.trim().parse().map_err(|_| ParamError::Parse {
        value: val.to_string(),
    })?;
    let narrow = wide as f32;
    // reject values that only fit in the wider type
    if wide.is_finite() && !narrow.is_finite() {
        return Err(ParamError::Parse {
            value: val.to_string(),
        });
    }
    *target = narrow;
    Ok(())
}

pub fn set_f64(target: &mut f64, val: &str) -> Result<(), ParamError> {
    *target = val.trim().parse().map_err(|_| ParamError::Parse {
        value: val.to_string(),
    })?;
    Ok(())
}

/// One of [yYtT1] sets, one of [nNfF0] clears.
pub fn set_bool(target: &mut bool, val: &str) -> Result<(), ParamError> {
    match val.chars().next() {
        Some('y' | 'Y' | 't' | 'T' | '1') => {
            *target = true;
            Ok(())
        }
        Some('n' | 'N' | 'f' | 'F' | '0') => {
            *target = false;
            Ok(())
        }
        _ => Err(ParamError::Parse {
            value: val.to_string(),
        }),
    }
}

pub fn set_invbool(target: &mut bool, val: &str) -> Result<(), ParamError> {
    let mut plain = false;
    set_bool(&mut plain, val)?;
    *target = !plain;
    Ok(())
}

const MAX_STRING_PARAM: usize = 1024;

pub fn set_string(target: &mut String, val: &str) -> Result<(), ParamError> {
    if val.len() > MAX_STRING_PARAM {
        return Err(ParamError::Overflow {
            value: val.to_string(),
            max: MAX_STRING_PARAM,
        });
    }
    *target = val.to_string();
    Ok(())
}

/// Bounded copy: `max` is the buffer size including the terminator, so
/// at most `max - 1` bytes are kept. Overflow truncates on a character
/// boundary and reports failure.
pub fn set_copystring(target: &mut String, val: &str, max: usize) -> Result<(), ParamError> {
    if val.len() + 1 > max {
        let keep = max.saturating_sub(1);
        let mut cut = keep;
        while cut > 0 && !val.is_char_boundary(cut) {
            cut -= 1;
        }
        *target = val[..cut].to_string();
        return Err(ParamError::Overflow {
            value: val.to_string(),
            max,
        });
    }
    *target = val.to_string();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_accept_strtol_prefixes() {
        let mut v: i32 = 0;
        set_i32(&mut v, "42").unwrap();
        assert_eq!(v, 42);
        set_i32(&mut v, "-7").unwrap();
        assert_eq!(v, -7);
        set_i32(&mut v, "0x20").unwrap();
        assert_eq!(v, 32);
        set_i32(&mut v, "017").unwrap();
        assert_eq!(v, 15);
        assert!(set_i32(&mut v, "twelve").is_err());
        assert!(set_i32(&mut v, "").is_err());
    }

    #[test]
    fn integers_reject_out_of_range_values() {
        let mut b: u8 = 0;
        set_u8(&mut b, "255").unwrap();
        assert!(set_u8(&mut b, "256").is_err());
        assert!(set_u8(&mut b, "-1").is_err());
        assert_eq!(b, 255);

        let mut s: i16 = 0;
        set_i16(&mut s, "-32768").unwrap();
        assert!(set_i16(&mut s, "40000").is_err());
    }

    #[test]
    fn floats_parse() {
        let mut f: f32 = 0.0;
        set_f32(&mut f, "1.5").unwrap();
        assert_eq!(f, 1.5);
        assert!(set_f32(&mut f, "1e80").is_err());

        let mut d: f64 = 0.0;
        set_f64(&mut d, "1e80").unwrap();
        assert_eq!(d, 1e80);
    }

    #[test]
    fn bool_alphabet() {
        let mut b = false;
        for yes in ["y", "Y", "t", "T", "1"] {
            b = false;
            set_bool(&mut b, yes).unwrap();
            assert!(b, "{yes} should set");
        }
        for no in ["n", "N", "f", "F", "0"] {
            b = true;
            set_bool(&mut b, no).unwrap();
            assert!(!b, "{no} should clear");
        }
        assert!(set_bool(&mut b, "x").is_err());
        assert!(set_bool(&mut b, "").is_err());

        set_invbool(&mut b, "y").unwrap();
        assert!(!b);
    }

    #[test]
    fn bounded_copy_truncates_and_fails() {
        let mut s = String::new();
        set_copystring(&mut s, "short", 32).unwrap();
        assert_eq!(s, "short");

        let err = set_copystring(&mut s, "much too long", 8).unwrap_err();
        assert!(matches!(err, ParamError::Overflow { max: 8, .. }));
        assert_eq!(s, "much to");
    }
}
