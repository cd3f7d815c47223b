// Format-spec mini language shared by f-strings, str.format and the % operator

use crate::error::{ScriptError, ScriptResult};
use crate::runtime::MAX_SEQUENCE;
use crate::value::float_repr;

/// Precision past this is refused rather than padded with zeros
const MAX_PRECISION: usize = 1_000;

/// Value reduced to what formatting cares about
#[derive(Debug, Clone, PartialEq)]
pub enum FormatArg {
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Spec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    zero: bool,
    width: usize,
    grouping: bool,
    precision: Option<usize>,
    ty: Option<char>,
}

fn parse_spec(spec: &str) -> ScriptResult<Spec> {
    let chars: Vec<char> = spec.chars().collect();
    let mut out = Spec::default();
    let mut i = 0;

    let is_align = |c: char| matches!(c, '<' | '>' | '^' | '=');
    if chars.len() >= 2 && is_align(chars[1]) {
        out.fill = Some(chars[0]);
        out.align = Some(chars[1]);
        i = 2;
    } else if !chars.is_empty() && is_align(chars[0]) {
        out.align = Some(chars[0]);
        i = 1;
    }
    if let Some(&c) = chars.get(i) {
        if matches!(c, '+' | '-' | ' ') {
            out.sign = Some(c);
            i += 1;
        }
    }
    if chars.get(i) == Some(&'0') {
        out.zero = true;
        i += 1;
    }
    let mut width = String::new();
    while let Some(c) = chars.get(i).filter(|c| c.is_ascii_digit()) {
        width.push(*c);
        i += 1;
    }
    if !width.is_empty() {
        out.width = width.parse().map_err(|_| too_large(spec))?;
        if out.width > MAX_SEQUENCE {
            return Err(too_large(spec));
        }
    }
    if chars.get(i) == Some(&',') || chars.get(i) == Some(&'_') {
        out.grouping = true;
        i += 1;
    }
    if chars.get(i) == Some(&'.') {
        i += 1;
        let mut precision = String::new();
        while let Some(c) = chars.get(i).filter(|c| c.is_ascii_digit()) {
            precision.push(*c);
            i += 1;
        }
        let precision: usize = precision.parse().map_err(|_| invalid(spec))?;
        if precision > MAX_PRECISION {
            return Err(too_large(spec));
        }
        out.precision = Some(precision);
    }
    if let Some(&c) = chars.get(i) {
        out.ty = Some(c);
        i += 1;
    }
    if i != chars.len() {
        return Err(invalid(spec));
    }
    Ok(out)
}

fn invalid(spec: &str) -> ScriptError {
    ScriptError::value_error(format!("Invalid format specifier '{}'", spec))
}

fn too_large(spec: &str) -> ScriptError {
    ScriptError::value_error(format!("Too many decimal digits or too wide in format specifier '{}'", spec))
}

fn group_thousands(digits: &str) -> String {
    let (int_part, rest) = match digits.find('.') {
        Some(pos) => digits.split_at(pos),
        None => (digits, ""),
    };
    let mut grouped = String::new();
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped + rest
}

fn scientific(value: f64, precision: usize) -> String {
    let text = format!("{:.*e}", precision, value);
    match text.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => text,
    }
}

fn strip_zeros(text: String) -> String {
    if let Some((mantissa, exp)) = text.split_once('e') {
        let mantissa = if mantissa.contains('.') {
            mantissa.trim_end_matches('0').trim_end_matches('.')
        } else {
            mantissa
        };
        return format!("{}e{}", mantissa, exp);
    }
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text
    }
}

fn general(value: f64, precision: usize) -> String {
    if value == 0.0 {
        return "0".into();
    }
    let p = precision.max(1);
    let exp = value.abs().log10().floor() as i32;
    if exp < -4 || exp >= p as i32 {
        strip_zeros(scientific(value, p - 1))
    } else {
        let decimals = (p as i32 - 1 - exp).max(0) as usize;
        strip_zeros(format!("{:.*}", decimals, value))
    }
}

fn type_name(arg: &FormatArg) -> &'static str {
    match arg {
        FormatArg::Int(_) => "int",
        FormatArg::Float(_) => "float",
        FormatArg::Text(_) => "str",
    }
}

/// Apply a `format()` spec such as `.2f`, `>10`, `,.0f` or `.1%`.
pub fn apply_spec(arg: &FormatArg, spec: &str) -> ScriptResult<String> {
    if spec.is_empty() {
        return Ok(match arg {
            FormatArg::Int(i) => i.to_string(),
            FormatArg::Float(f) => float_repr(*f),
            FormatArg::Text(s) => s.clone(),
        });
    }
    let spec_data = parse_spec(spec)?;
    let unknown = |code: char| {
        ScriptError::value_error(format!(
            "Unknown format code '{}' for object of type '{}'",
            code,
            type_name(arg)
        ))
    };

    let (body, numeric, negative) = match arg {
        FormatArg::Text(s) => {
            if let Some(code) = spec_data.ty.filter(|c| *c != 's') {
                return Err(unknown(code));
            }
            let text: String = match spec_data.precision {
                Some(p) => s.chars().take(p).collect(),
                None => s.clone(),
            };
            (text, false, false)
        }
        FormatArg::Int(i) => {
            let negative = *i < 0;
            let magnitude = i.unsigned_abs();
            let body = match spec_data.ty {
                None | Some('d') | Some('n') => magnitude.to_string(),
                Some('x') => format!("{:x}", magnitude),
                Some('X') => format!("{:X}", magnitude),
                Some('o') => format!("{:o}", magnitude),
                Some('b') => format!("{:b}", magnitude),
                Some('f' | 'F' | 'e' | 'E' | 'g' | 'G' | '%') => {
                    return apply_spec(&FormatArg::Float(*i as f64), spec);
                }
                Some(code) => return Err(unknown(code)),
            };
            (body, true, negative)
        }
        FormatArg::Float(f) => {
            let negative = f.is_sign_negative() && *f != 0.0;
            let magnitude = f.abs();
            let body = if magnitude.is_nan() {
                "nan".to_string()
            } else if magnitude.is_infinite() {
                "inf".to_string()
            } else {
                match spec_data.ty {
                    Some('f') | Some('F') => format!("{:.*}", spec_data.precision.unwrap_or(6), magnitude),
                    Some('e') => scientific(magnitude, spec_data.precision.unwrap_or(6)),
                    Some('E') => scientific(magnitude, spec_data.precision.unwrap_or(6)).to_uppercase(),
                    Some('%') => format!("{:.*}%", spec_data.precision.unwrap_or(6), magnitude * 100.0),
                    Some('g') | Some('G') => general(magnitude, spec_data.precision.unwrap_or(6)),
                    None => match spec_data.precision {
                        Some(p) => general(magnitude, p),
                        None => float_repr(magnitude),
                    },
                    Some(code) => return Err(unknown(code)),
                }
            };
            (body, true, negative)
        }
    };

    let body = if spec_data.grouping && numeric {
        match body.strip_suffix('%') {
            Some(inner) => group_thousands(inner) + "%",
            None => group_thousands(&body),
        }
    } else {
        body
    };

    let sign = if !numeric {
        ""
    } else if negative {
        "-"
    } else {
        match spec_data.sign {
            Some('+') => "+",
            Some(' ') => " ",
            _ => "",
        }
    };

    let content_len = sign.chars().count() + body.chars().count();
    if content_len >= spec_data.width {
        return Ok(format!("{}{}", sign, body));
    }
    let pad = spec_data.width - content_len;

    let (fill, align) = if spec_data.zero && spec_data.align.is_none() && numeric {
        ('0', '=')
    } else {
        let default_align = if numeric { '>' } else { '<' };
        (
            spec_data.fill.unwrap_or(' '),
            spec_data.align.unwrap_or(default_align),
        )
    };
    let padding = |n: usize| std::iter::repeat(fill).take(n).collect::<String>();

    Ok(match align {
        '<' => format!("{}{}{}", sign, body, padding(pad)),
        '^' => format!("{}{}{}{}", padding(pad / 2), sign, body, padding(pad - pad / 2)),
        '=' => format!("{}{}{}", sign, padding(pad), body),
        _ => format!("{}{}{}", padding(pad), sign, body),
    })
}

/// Printf-style `fmt % args`.
pub fn percent_format(fmt: &str, args: &[FormatArg], reprs: &[String]) -> ScriptResult<String> {
    let chars: Vec<char> = fmt.chars().collect();
    let mut out = String::new();
    let mut next = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        if c != '%' {
            out.push(c);
            i += 1;
            continue;
        }
        i += 1;
        let mut flags = String::new();
        while let Some(&f) = chars.get(i).filter(|f| matches!(f, '-' | '+' | ' ' | '0' | '#')) {
            flags.push(f);
            i += 1;
        }
        let mut width = String::new();
        while let Some(&d) = chars.get(i).filter(|d| d.is_ascii_digit()) {
            width.push(d);
            i += 1;
        }
        let mut precision = None;
        if chars.get(i) == Some(&'.') {
            i += 1;
            let mut p = String::new();
            while let Some(&d) = chars.get(i).filter(|d| d.is_ascii_digit()) {
                p.push(d);
                i += 1;
            }
            precision = Some(p);
        }
        let Some(&conv) = chars.get(i) else {
            return Err(ScriptError::value_error("incomplete format"));
        };
        i += 1;
        if conv == '%' {
            out.push('%');
            continue;
        }

        let arg = args
            .get(next)
            .ok_or_else(|| ScriptError::type_error("not enough arguments for format string"))?;
        let repr = reprs.get(next).cloned().unwrap_or_default();
        next += 1;

        let mut spec = String::new();
        if flags.contains('-') {
            spec.push('<');
        } else if matches!(conv, 's' | 'r') {
            spec.push('>');
        }
        if flags.contains('+') {
            spec.push('+');
        } else if flags.contains(' ') {
            spec.push(' ');
        }
        if flags.contains('0') && !flags.contains('-') {
            spec.push('0');
        }
        spec.push_str(&width);
        if let Some(p) = &precision {
            spec.push('.');
            spec.push_str(if p.is_empty() { "0" } else { p });
        }

        let piece = match conv {
            's' => {
                let text = match arg {
                    FormatArg::Text(s) => s.clone(),
                    FormatArg::Int(v) => v.to_string(),
                    FormatArg::Float(v) => float_repr(*v),
                };
                apply_spec(&FormatArg::Text(text), &spec)?
            }
            'r' => apply_spec(&FormatArg::Text(repr), &spec)?,
            'd' | 'i' | 'u' => {
                let value = match arg {
                    FormatArg::Int(v) => *v,
                    FormatArg::Float(v) => v.trunc() as i64,
                    FormatArg::Text(_) => {
                        return Err(ScriptError::type_error("%d format: a real number is required, not str"))
                    }
                };
                spec.truncate(spec.find('.').unwrap_or(spec.len()));
                apply_spec(&FormatArg::Int(value), &spec)?
            }
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'x' | 'X' | 'o' => {
                let numeric = match arg {
                    FormatArg::Text(_) => {
                        return Err(ScriptError::type_error(format!(
                            "%{} format: a real number is required, not str",
                            conv
                        )))
                    }
                    FormatArg::Int(v) if matches!(conv, 'x' | 'X' | 'o') => FormatArg::Int(*v),
                    FormatArg::Float(v) if matches!(conv, 'x' | 'X' | 'o') => {
                        return Err(ScriptError::type_error(format!(
                            "%{} format: an integer is required, not float ({})",
                            conv, v
                        )))
                    }
                    FormatArg::Int(v) => FormatArg::Float(*v as f64),
                    other => other.clone(),
                };
                spec.push(conv);
                apply_spec(&numeric, &spec)?
            }
            other => {
                return Err(ScriptError::value_error(format!(
                    "unsupported format character '{}'",
                    other
                )))
            }
        };
        out.push_str(&piece);
    }

    if next < args.len() {
        return Err(ScriptError::type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

/// One replacement field of a `str.format` template
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Literal(String),
    Replace {
        /// Empty for automatic numbering
        name: String,
        conversion: Option<char>,
        spec: String,
    },
}

pub fn parse_template(template: &str) -> ScriptResult<Vec<Field>> {
    let chars: Vec<char> = template.chars().collect();
    let mut fields = Vec::new();
    let mut literal = String::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                literal.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                literal.push('}');
                i += 2;
            }
            '{' => {
                if !literal.is_empty() {
                    fields.push(Field::Literal(std::mem::take(&mut literal)));
                }
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == '}')
                    .ok_or_else(|| ScriptError::value_error("Single '{' encountered in format string"))?;
                let inner: String = chars[i + 1..i + close].iter().collect();
                let (head, spec) = match inner.split_once(':') {
                    Some((h, s)) => (h.to_string(), s.to_string()),
                    None => (inner.clone(), String::new()),
                };
                let (name, conversion) = match head.split_once('!') {
                    Some((n, c)) => (n.to_string(), c.chars().next()),
                    None => (head, None),
                };
                fields.push(Field::Replace { name, conversion, spec });
                i += close + 1;
            }
            '}' => return Err(ScriptError::value_error("Single '}' encountered in format string")),
            c => {
                literal.push(c);
                i += 1;
            }
        }
    }
    if !literal.is_empty() {
        fields.push(Field::Literal(literal));
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_point_and_grouping() {
        assert_eq!(apply_spec(&FormatArg::Float(3.14159), ".2f").unwrap(), "3.14");
        assert_eq!(apply_spec(&FormatArg::Float(1234567.891), ",.2f").unwrap(), "1,234,567.89");
        assert_eq!(apply_spec(&FormatArg::Int(1234567), ",").unwrap(), "1,234,567");
        assert_eq!(apply_spec(&FormatArg::Float(-2.5), "+.1f").unwrap(), "-2.5");
        assert_eq!(apply_spec(&FormatArg::Float(2.5), "+.1f").unwrap(), "+2.5");
        assert_eq!(apply_spec(&FormatArg::Float(0.256), ".1%").unwrap(), "25.6%");
    }

    #[test]
    fn test_oversized_width_and_precision_are_refused() {
        for spec in ["99999999999999", "99999999999999999999999", ".5000f", "10000001"] {
            let err = apply_spec(&FormatArg::Int(1), spec).unwrap_err();
            assert!(err.message.starts_with("ValueError"), "{spec}: {}", err.message);
        }
        assert!(percent_format("%99999999999999d", &[FormatArg::Int(1)], &[String::new()]).is_err());
        assert_eq!(apply_spec(&FormatArg::Float(1.0), ".20f").unwrap(), "1.00000000000000000000");
    }

    #[test]
    fn test_width_and_alignment() {
        assert_eq!(apply_spec(&FormatArg::Int(42), "5").unwrap(), "   42");
        assert_eq!(apply_spec(&FormatArg::Int(-42), "05").unwrap(), "-0042");
        assert_eq!(apply_spec(&FormatArg::Text("ab".into()), "5").unwrap(), "ab   ");
        assert_eq!(apply_spec(&FormatArg::Text("ab".into()), "*^6").unwrap(), "**ab**");
        assert_eq!(apply_spec(&FormatArg::Float(1.5), "<8.2f").unwrap(), "1.50    ");
    }

    #[test]
    fn test_general_and_scientific() {
        assert_eq!(apply_spec(&FormatArg::Float(1234.5), "e").unwrap(), "1.234500e+03");
        assert_eq!(apply_spec(&FormatArg::Float(0.0001234), "g").unwrap(), "0.0001234");
        assert_eq!(apply_spec(&FormatArg::Float(123456789.0), "g").unwrap(), "1.23457e+08");
        assert_eq!(apply_spec(&FormatArg::Float(2.0), "").unwrap(), "2.0");
    }

    #[test]
    fn test_type_mismatch() {
        assert!(apply_spec(&FormatArg::Float(1.5), "d").is_err());
        assert!(apply_spec(&FormatArg::Text("x".into()), ".2f").is_err());
        assert_eq!(apply_spec(&FormatArg::Int(7), ".2f").unwrap(), "7.00");
    }

    #[test]
    fn test_percent_operator() {
        let args = [FormatArg::Text("BUY".into()), FormatArg::Float(101.256), FormatArg::Int(3)];
        let reprs = vec![String::new(); 3];
        assert_eq!(
            percent_format("%s at %.2f x%d (100%%)", &args, &reprs).unwrap(),
            "BUY at 101.26 x3 (100%)"
        );
        assert_eq!(
            percent_format("[%5s|%-5d]", &[FormatArg::Text("a".into()), FormatArg::Int(1)], &reprs).unwrap(),
            "[    a|1    ]"
        );
        assert!(percent_format("%s %s", &args[..1], &reprs).is_err());
        assert!(percent_format("%s", &args, &reprs).is_err());
    }

    #[test]
    fn test_template_fields() {
        let fields = parse_template("{} {0:.2f} {name!r} {{x}}").unwrap();
        assert_eq!(fields.len(), 6);
        assert_eq!(
            fields[2],
            Field::Replace {
                name: "0".into(),
                conversion: None,
                spec: ".2f".into()
            }
        );
        assert_eq!(fields[5], Field::Literal(" {x}".into()));
        assert!(parse_template("{").is_err());
    }
}
