//! Billing-date extraction from membership page text.
//!
//! The displayed date follows the account's UI locale, so the parser
//! accepts English month names (full and short, including the `Sept`
//! variant), Korean `M월 D일`, Portuguese/Spanish/Turkish month names, ISO
//! dates, and bare numeric dates. Numeric `D/M` vs `M/D` is disambiguated
//! by range; a value over 12 can only be a day.

use chrono::{Datelike, NaiveDate};

const EN_MONTHS: &[(&str, u32)] = &[
    ("january", 1),
    ("february", 2),
    ("march", 3),
    ("april", 4),
    ("may", 5),
    ("june", 6),
    ("july", 7),
    ("august", 8),
    ("september", 9),
    ("october", 10),
    ("november", 11),
    ("december", 12),
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("sept", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

const PT_MONTHS: &[(&str, u32)] = &[
    ("janeiro", 1),
    ("fevereiro", 2),
    ("março", 3),
    ("abril", 4),
    ("maio", 5),
    ("junho", 6),
    ("julho", 7),
    ("agosto", 8),
    ("setembro", 9),
    ("outubro", 10),
    ("novembro", 11),
    ("dezembro", 12),
];

const ES_MONTHS: &[(&str, u32)] = &[
    ("enero", 1),
    ("febrero", 2),
    ("marzo", 3),
    ("abril", 4),
    ("mayo", 5),
    ("junio", 6),
    ("julio", 7),
    ("agosto", 8),
    ("septiembre", 9),
    ("octubre", 10),
    ("noviembre", 11),
    ("diciembre", 12),
];

const TR_MONTHS: &[(&str, u32)] = &[
    ("ocak", 1),
    ("şubat", 2),
    ("mart", 3),
    ("nisan", 4),
    ("mayıs", 5),
    ("haziran", 6),
    ("temmuz", 7),
    ("ağustos", 8),
    ("eylül", 9),
    ("ekim", 10),
    ("kasım", 11),
    ("aralık", 12),
];

fn month_of(token: &str) -> Option<u32> {
    for table in [EN_MONTHS, PT_MONTHS, ES_MONTHS, TR_MONTHS] {
        if let Some((_, m)) = table.iter().find(|(name, _)| *name == token) {
            return Some(*m);
        }
    }
    None
}

fn trim_token(raw: &str) -> &str {
    raw.trim_matches(|c: char| !c.is_alphanumeric() && c != '/' && c != '-')
}

fn parse_day(token: &str) -> Option<u32> {
    let t = token
        .trim_end_matches("th")
        .trim_end_matches("st")
        .trim_end_matches("nd")
        .trim_end_matches("rd");
    let day: u32 = t.parse().ok()?;
    (1..=31).contains(&day).then_some(day)
}

fn parse_year(token: &str) -> Option<i32> {
    let year: i32 = token.parse().ok()?;
    (1990..=2100).contains(&year).then_some(year)
}

/// A year-less date means the next occurrence on or after `today`.
fn with_inferred_year(month: u32, day: u32, today: NaiveDate) -> Option<NaiveDate> {
    let this_year = NaiveDate::from_ymd_opt(today.year(), month, day)?;
    if this_year < today {
        NaiveDate::from_ymd_opt(today.year() + 1, month, day)
    } else {
        Some(this_year)
    }
}

/// `M/D[/Y]` or `D/M[/Y]`; a component over 12 pins the day side. An
/// ambiguous pair (both <= 12) reads as `M/D`, the format the membership
/// page uses in its default locale.
fn parse_numeric(token: &str, today: NaiveDate) -> Option<NaiveDate> {
    let parts: Vec<&str> = token.split('/').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return None;
    }
    let a: u32 = parts[0].parse().ok()?;
    let b: u32 = parts[1].parse().ok()?;
    let year = match parts.get(2) {
        Some(y) => Some(parse_year(y)?),
        None => None,
    };

    let (month, day) = if a > 12 && b <= 12 {
        (b, a)
    } else if b > 12 && a <= 12 {
        (a, b)
    } else if a <= 12 && b <= 12 {
        (a, b)
    } else {
        return None;
    };
    if !(1..=31).contains(&day) {
        return None;
    }

    match year {
        Some(y) => NaiveDate::from_ymd_opt(y, month, day),
        None => with_inferred_year(month, day, today),
    }
}

/// Korean `[YYYY년] M월 D일` anywhere in the text.
fn parse_korean(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    // The marker characters also occur inside ordinary words ("결제일"
    // ends in 일), so only an occurrence directly preceded by digits
    // counts.
    let num_before = |marker: &str| -> Option<u32> {
        for (idx, _) in text.match_indices(marker) {
            let digits: String = text[..idx]
                .chars()
                .rev()
                .take_while(|c| c.is_ascii_digit())
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            if let Ok(n) = digits.parse() {
                return Some(n);
            }
        }
        None
    };

    let month = num_before("월")?;
    let day = num_before("일")?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    match num_before("년") {
        Some(year) => NaiveDate::from_ymd_opt(year as i32, month, day),
        None => with_inferred_year(month, day, today),
    }
}

/// Extract the first billing date found in `text`.
pub fn parse_billing_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    if let Some(d) = parse_korean(text, today) {
        return Some(d);
    }

    let lower = text.to_lowercase();
    let tokens: Vec<&str> = lower.split_whitespace().map(trim_token).collect();

    // ISO first; it is unambiguous.
    for token in &tokens {
        if token.len() == 10 && token.as_bytes().get(4) == Some(&b'-') {
            if let Ok(d) = NaiveDate::parse_from_str(token, "%Y-%m-%d") {
                return Some(d);
            }
        }
    }

    // Month name with a day on either side: "january 25, 2026",
    // "25 de janeiro de 2026", "25 ocak 2026", "sept 5".
    for (i, token) in tokens.iter().enumerate() {
        let Some(month) = month_of(token) else {
            continue;
        };
        let day_after = tokens.get(i + 1).and_then(|t| parse_day(t));
        let day_before = i
            .checked_sub(1)
            .and_then(|j| tokens.get(j))
            .and_then(|t| parse_day(t))
            .or_else(|| {
                // "25 de janeiro": the day sits one connective earlier.
                i.checked_sub(2)
                    .and_then(|j| tokens.get(j))
                    .and_then(|t| parse_day(t))
            });
        let Some(day) = day_after.or(day_before) else {
            continue;
        };

        let year = tokens
            .iter()
            .skip(i + 1)
            .take(3)
            .find_map(|t| parse_year(t));
        return match year {
            Some(y) => NaiveDate::from_ymd_opt(y, month, day),
            None => with_inferred_year(month, day, today),
        };
    }

    // Bare numeric forms last; they are the most false-positive prone.
    for token in &tokens {
        if token.contains('/') {
            if let Some(d) = parse_numeric(token, today) {
                return Some(d);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 25).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y, m, d)
    }

    #[test]
    fn english_full_and_short() {
        assert_eq!(
            parse_billing_date("Your membership resumes on January 25, 2026", today()),
            date(2026, 1, 25)
        );
        assert_eq!(
            parse_billing_date("Next billing date: Jan 25, 2026", today()),
            date(2026, 1, 25)
        );
        assert_eq!(
            parse_billing_date("Billing date: Sept 5, 2026", today()),
            date(2026, 9, 5)
        );
        assert_eq!(
            parse_billing_date("renews 25 January 2026", today()),
            date(2026, 1, 25)
        );
    }

    #[test]
    fn english_year_less_rolls_forward() {
        // Dec 25 is today: stays in this year.
        assert_eq!(
            parse_billing_date("renews December 25", today()),
            date(2025, 12, 25)
        );
        // Jan 25 already passed this year: next occurrence.
        assert_eq!(
            parse_billing_date("renews on January 25th", today()),
            date(2026, 1, 25)
        );
    }

    #[test]
    fn korean_forms() {
        assert_eq!(
            parse_billing_date("다음 결제일: 1월 25일", today()),
            date(2026, 1, 25)
        );
        assert_eq!(
            parse_billing_date("2026년 1월 25일에 재개됩니다", today()),
            date(2026, 1, 25)
        );
    }

    #[test]
    fn portuguese_spanish_turkish() {
        assert_eq!(
            parse_billing_date("renovação em 25 de janeiro de 2026", today()),
            date(2026, 1, 25)
        );
        assert_eq!(
            parse_billing_date("se renueva el 25 de enero de 2026", today()),
            date(2026, 1, 25)
        );
        assert_eq!(
            parse_billing_date("yenileme tarihi 25 Ocak 2026", today()),
            date(2026, 1, 25)
        );
    }

    #[test]
    fn iso_and_numeric() {
        assert_eq!(
            parse_billing_date("next: 2026-01-25", today()),
            date(2026, 1, 25)
        );
        // 25 can only be a day.
        assert_eq!(
            parse_billing_date("billing on 25/1/2026", today()),
            date(2026, 1, 25)
        );
        assert_eq!(
            parse_billing_date("billing on 1/25/2026", today()),
            date(2026, 1, 25)
        );
        // Ambiguous pair reads month-first.
        assert_eq!(
            parse_billing_date("billing on 2/3/2026", today()),
            date(2026, 2, 3)
        );
    }

    #[test]
    fn rejects_text_without_dates() {
        assert_eq!(parse_billing_date("Manage your membership", today()), None);
        assert_eq!(parse_billing_date("", today()), None);
        assert_eq!(parse_billing_date("renews May", today()), None);
        assert_eq!(parse_billing_date("32/13/2026", today()), None);
    }
}
