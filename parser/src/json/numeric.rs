//! Regexes for bounded integer and decimal ranges, built digit by digit.

use anyhow::{anyhow, bail, ensure, Result};

fn mk_or(parts: Vec<String>) -> String {
    if parts.len() == 1 {
        parts[0].clone()
    } else {
        format!("({})", parts.join("|"))
    }
}

fn num_digits(n: i64) -> usize {
    n.unsigned_abs().to_string().len()
}

fn parse_i64(s: &str) -> Result<i64> {
    s.parse::<i64>()
        .map_err(|_| anyhow!("numeric bound {} out of range", s))
}

fn first_digit(s: &str) -> Result<u32> {
    s.chars()
        .next()
        .and_then(|c| c.to_digit(10))
        .ok_or_else(|| anyhow!("expected digit in {:?}", s))
}

pub fn rx_int_range(left: Option<i64>, right: Option<i64>) -> Result<String> {
    Ok(match (left, right) {
        (None, None) => "-?(0|[1-9][0-9]*)".to_string(),
        (Some(left), None) => {
            if left < 0 {
                mk_or(vec![
                    rx_int_range(Some(left), Some(-1))?,
                    rx_int_range(Some(0), None)?,
                ])
            } else {
                let upper = parse_i64(&"9".repeat(num_digits(left)))?;
                mk_or(vec![
                    rx_int_range(Some(left), Some(upper))?,
                    format!("[1-9][0-9]{{{},}}", num_digits(left)),
                ])
            }
        }
        (None, Some(right)) => {
            if right >= 0 {
                mk_or(vec![
                    rx_int_range(Some(0), Some(right))?,
                    rx_int_range(None, Some(-1))?,
                ])
            } else {
                format!("-{}", rx_int_range(Some(-right), None)?)
            }
        }
        (Some(left), Some(right)) => {
            ensure!(left <= right, "minimum {} is greater than maximum {}", left, right);
            if left < 0 {
                if right < 0 {
                    format!("(-{})", rx_int_range(Some(-right), Some(-left))?)
                } else {
                    format!(
                        "(-{}|{})",
                        rx_int_range(Some(1), Some(-left))?,
                        rx_int_range(Some(0), Some(right))?
                    )
                }
            } else if num_digits(left) == num_digits(right) {
                let l = left.to_string();
                let r = right.to_string();
                if left == right {
                    return Ok(format!("({})", l));
                }

                let lpref = &l[..l.len() - 1];
                let lx = &l[l.len() - 1..];
                let rpref = &r[..r.len() - 1];
                let rx = &r[r.len() - 1..];

                if lpref == rpref {
                    return Ok(format!("({}[{}-{}])", lpref, lx, rx));
                }

                let mut lo = parse_i64(lpref)?;
                let mut hi = parse_i64(rpref)?;
                let mut parts = vec![];

                if lx != "0" {
                    parts.push(format!("{}[{}-9]", lpref, lx));
                    lo += 1;
                }
                if rx != "9" {
                    parts.push(format!("{}[0-{}]", rpref, rx));
                    hi -= 1;
                }
                if lo <= hi {
                    let inner = rx_int_range(Some(lo), Some(hi))?;
                    parts.push(format!("{}[0-9]", inner));
                }

                mk_or(parts)
            } else {
                let break_point = 10_i64
                    .checked_pow(num_digits(left) as u32)
                    .ok_or_else(|| anyhow!("numeric bound {} out of range", left))?
                    - 1;
                mk_or(vec![
                    rx_int_range(Some(left), Some(break_point))?,
                    rx_int_range(Some(break_point + 1), Some(right))?,
                ])
            }
        }
    })
}

fn lexi_x_to_9(x: &str, incl: bool) -> Result<String> {
    if x.is_empty() {
        return Ok(if incl { "[0-9]*" } else { "[0-9]*[1-9]" }.to_string());
    }
    if incl && x.len() == 1 {
        return Ok(format!("[{}-9][0-9]*", x));
    }
    let x0 = first_digit(x)?;
    let mut parts = vec![format!("{}{}", x0, lexi_x_to_9(&x[1..], incl)?)];
    if x0 < 9 {
        parts.push(format!("[{}-9][0-9]*", x0 + 1));
    }
    Ok(mk_or(parts))
}

fn lexi_0_to_x(x: &str, incl: bool) -> Result<String> {
    if x.is_empty() {
        ensure!(incl, "empty exclusive range");
        // the bound itself, spelled with any number of trailing zeros
        return Ok("0*".to_string());
    }
    let x0 = first_digit(x)?;

    if !incl && x.len() == 1 {
        ensure!(x0 > 0, "empty exclusive range");
        return Ok(format!("[0-{}][0-9]*", x0 - 1));
    }

    let mut parts = vec![format!("{}{}", x0, lexi_0_to_x(&x[1..], incl)?)];
    if x0 > 0 {
        parts.push(format!("[0-{}][0-9]*", x0 - 1));
    }
    Ok(mk_or(parts))
}

fn lexi_range(ld: &str, rd: &str, ld_incl: bool, rd_incl: bool) -> Result<String> {
    ensure!(ld.len() == rd.len(), "digit strings of different length");
    if ld == rd {
        ensure!(ld_incl && rd_incl, "empty range");
        return Ok(format!("{}0*", ld));
    }
    let l0 = first_digit(ld)?;
    let r0 = first_digit(rd)?;
    if l0 == r0 {
        return Ok(format!(
            "{}{}",
            l0,
            lexi_range(&ld[1..], &rd[1..], ld_incl, rd_incl)?
        ));
    }
    ensure!(l0 < r0, "decreasing range");
    let ld_rest = ld[1..].trim_end_matches('0');
    let mut parts = vec![format!("{}{}", l0, lexi_x_to_9(ld_rest, ld_incl)?)];
    if l0 + 1 < r0 {
        parts.push(format!("[{}-{}][0-9]*", l0 + 1, r0 - 1));
    }
    let rd_rest = rd[1..].trim_end_matches('0');
    if !rd_rest.is_empty() || rd_incl {
        parts.push(format!("{}{}", r0, lexi_0_to_x(rd_rest, rd_incl)?));
    }
    Ok(mk_or(parts))
}

fn float_to_str(f: f64) -> String {
    format!("{}", f)
}

pub fn rx_float_range(
    left: Option<f64>,
    right: Option<f64>,
    left_inclusive: bool,
    right_inclusive: bool,
) -> Result<String> {
    for v in [left, right].into_iter().flatten() {
        ensure!(v.is_finite(), "non-finite numeric bound {}", v);
    }
    Ok(match (left, right) {
        (None, None) => "-?(0|[1-9][0-9]*)(\\.[0-9]+)?([eE][+-]?[0-9]+)?".to_string(),
        (Some(left), None) => {
            if left < 0.0 {
                mk_or(vec![
                    rx_float_range(Some(left), Some(0.0), left_inclusive, false)?,
                    rx_float_range(Some(0.0), None, true, false)?,
                ])
            } else {
                let digits = num_digits(left as i64);
                mk_or(vec![
                    rx_float_range(
                        Some(left),
                        Some(10f64.powi(digits as i32)),
                        left_inclusive,
                        false,
                    )?,
                    format!("[1-9][0-9]{{{},}}(\\.[0-9]+)?", digits),
                ])
            }
        }
        (None, Some(right)) => {
            if right == 0.0 {
                let r = format!("-{}", rx_float_range(Some(0.0), None, false, false)?);
                if right_inclusive {
                    mk_or(vec![r, "0(\\.0+)?".to_string()])
                } else {
                    r
                }
            } else if right > 0.0 {
                mk_or(vec![
                    format!("-{}", rx_float_range(Some(0.0), None, false, false)?),
                    rx_float_range(Some(0.0), Some(right), true, right_inclusive)?,
                ])
            } else {
                format!(
                    "-{}",
                    rx_float_range(Some(-right), None, right_inclusive, false)?
                )
            }
        }
        (Some(left), Some(right)) => {
            ensure!(left <= right, "minimum {} is greater than maximum {}", left, right);
            if left == right {
                ensure!(
                    left_inclusive && right_inclusive,
                    "empty numeric range ({}, {})",
                    left,
                    right
                );
                let s = float_to_str(left);
                if s.contains('.') {
                    format!("({}0*)", s.replace('.', "\\."))
                } else {
                    format!("({}(\\.0+)?)", s)
                }
            } else if left < 0.0 {
                if right < 0.0 {
                    format!(
                        "(-{})",
                        rx_float_range(Some(-right), Some(-left), right_inclusive, left_inclusive)?
                    )
                } else {
                    // no -0
                    let mut parts = vec![format!(
                        "(-{})",
                        rx_float_range(Some(0.0), Some(-left), false, left_inclusive)?
                    )];
                    if right > 0.0 || right_inclusive {
                        parts.push(rx_float_range(Some(0.0), Some(right), true, right_inclusive)?);
                    }
                    mk_or(parts)
                }
            } else {
                let l = float_to_str(left);
                let r = float_to_str(right);
                let int_part = |s: &str| parse_i64(s.split('.').next().unwrap_or(""));
                let mut left_rec = int_part(&l)?;
                let right_rec = int_part(&r)?;

                let mut ld = l.split('.').nth(1).unwrap_or("").to_string();
                let mut rd = r.split('.').nth(1).unwrap_or("").to_string();

                if left_rec == right_rec {
                    while ld.len() < rd.len() {
                        ld.push('0');
                    }
                    while rd.len() < ld.len() {
                        rd.push('0');
                    }
                    let suff = format!(
                        "\\.{}",
                        lexi_range(&ld, &rd, left_inclusive, right_inclusive)?
                    );
                    if ld.chars().all(|c| c == '0') && left_inclusive {
                        format!("({}({})?)", left_rec, suff)
                    } else {
                        format!("({}{})", left_rec, suff)
                    }
                } else {
                    let mut parts = vec![];
                    if !ld.is_empty() || !left_inclusive {
                        parts.push(format!(
                            "({}\\.{})",
                            left_rec,
                            lexi_x_to_9(&ld, left_inclusive)?
                        ));
                        left_rec += 1;
                    }

                    if right_rec > left_rec {
                        let inner = rx_int_range(Some(left_rec), Some(right_rec - 1))?;
                        parts.push(format!("({}(\\.[0-9]+)?)", inner));
                    }

                    if !rd.is_empty() {
                        parts.push(format!(
                            "({}(\\.{})?)",
                            right_rec,
                            lexi_0_to_x(&rd, right_inclusive)?
                        ));
                    } else if right_inclusive {
                        parts.push(format!("{}(\\.0+)?", right_rec));
                    }

                    if parts.is_empty() {
                        bail!("empty numeric range ({}, {})", left, right);
                    }
                    mk_or(parts)
                }
            }
        }
    })
}
