//! Address canonicalization.
//!
//! Every source formats addresses its own way ("123 Main St." vs
//! "123 MAIN STREET"). [`normalize`] maps them onto one comparable form. It is
//! pure and idempotent: feeding a normalized address back in returns it
//! unchanged.

use serde::{Deserialize, Serialize};

use crate::AddressFields;

/// Comparable representation of an address; every field may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizedAddress {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
}

impl NormalizedAddress {
    /// `"street city state zip"` with empty parts omitted.
    pub fn comparison_key(&self) -> String {
        [&self.street, &self.city, &self.state, &self.zip]
            .into_iter()
            .filter(|p| !p.is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_empty(&self) -> bool {
        self.street.is_empty() && self.city.is_empty() && self.state.is_empty() && self.zip.is_empty()
    }
}

pub fn normalize(fields: &AddressFields) -> NormalizedAddress {
    NormalizedAddress {
        street: normalize_street(&fields.street),
        city: normalize_city(&fields.city),
        state: normalize_state(&fields.state),
        zip: normalize_zip(&fields.zip),
    }
}

const STREET_TOKENS: &[(&str, &str)] = &[
    ("st", "street"),
    ("str", "street"),
    ("street", "street"),
    ("ave", "avenue"),
    ("av", "avenue"),
    ("avn", "avenue"),
    ("avenue", "avenue"),
    ("rd", "road"),
    ("road", "road"),
    ("dr", "drive"),
    ("drv", "drive"),
    ("drive", "drive"),
    ("blvd", "boulevard"),
    ("boul", "boulevard"),
    ("boulevard", "boulevard"),
    ("ln", "lane"),
    ("lane", "lane"),
    ("ct", "court"),
    ("crt", "court"),
    ("court", "court"),
    ("pl", "place"),
    ("place", "place"),
    ("ter", "terrace"),
    ("terr", "terrace"),
    ("terrace", "terrace"),
    ("pkwy", "parkway"),
    ("pky", "parkway"),
    ("parkway", "parkway"),
    ("hwy", "highway"),
    ("highway", "highway"),
    ("cir", "circle"),
    ("circle", "circle"),
    ("trl", "trail"),
    ("trail", "trail"),
    ("sq", "square"),
    ("square", "square"),
    ("way", "way"),
    ("n", "north"),
    ("north", "north"),
    ("s", "south"),
    ("south", "south"),
    ("e", "east"),
    ("east", "east"),
    ("w", "west"),
    ("west", "west"),
    ("ne", "northeast"),
    ("northeast", "northeast"),
    ("nw", "northwest"),
    ("northwest", "northwest"),
    ("se", "southeast"),
    ("southeast", "southeast"),
    ("sw", "southwest"),
    ("southwest", "southwest"),
    ("apt", "apartment"),
    ("apartment", "apartment"),
    ("ste", "suite"),
    ("suite", "suite"),
    ("unit", "unit"),
    ("fl", "floor"),
    ("floor", "floor"),
];

const CITY_TOKENS: &[(&str, &str)] = &[
    ("st", "saint"),
    ("ste", "sainte"),
    ("ft", "fort"),
    ("mt", "mount"),
];

const STATES: &[(&str, &str)] = &[
    ("alabama", "al"),
    ("alaska", "ak"),
    ("arizona", "az"),
    ("arkansas", "ar"),
    ("california", "ca"),
    ("colorado", "co"),
    ("connecticut", "ct"),
    ("delaware", "de"),
    ("district of columbia", "dc"),
    ("florida", "fl"),
    ("georgia", "ga"),
    ("hawaii", "hi"),
    ("idaho", "id"),
    ("illinois", "il"),
    ("indiana", "in"),
    ("iowa", "ia"),
    ("kansas", "ks"),
    ("kentucky", "ky"),
    ("louisiana", "la"),
    ("maine", "me"),
    ("maryland", "md"),
    ("massachusetts", "ma"),
    ("michigan", "mi"),
    ("minnesota", "mn"),
    ("mississippi", "ms"),
    ("missouri", "mo"),
    ("montana", "mt"),
    ("nebraska", "ne"),
    ("nevada", "nv"),
    ("new hampshire", "nh"),
    ("new jersey", "nj"),
    ("new mexico", "nm"),
    ("new york", "ny"),
    ("north carolina", "nc"),
    ("north dakota", "nd"),
    ("ohio", "oh"),
    ("oklahoma", "ok"),
    ("oregon", "or"),
    ("pennsylvania", "pa"),
    ("puerto rico", "pr"),
    ("rhode island", "ri"),
    ("south carolina", "sc"),
    ("south dakota", "sd"),
    ("tennessee", "tn"),
    ("texas", "tx"),
    ("utah", "ut"),
    ("vermont", "vt"),
    ("virginia", "va"),
    ("washington", "wa"),
    ("west virginia", "wv"),
    ("wisconsin", "wi"),
    ("wyoming", "wy"),
];

/// Lowercase, drop periods and apostrophes, turn remaining punctuation into
/// spaces, and split on whitespace.
fn clean_tokens(input: &str) -> Vec<String> {
    input
        .to_lowercase()
        .chars()
        .filter(|&c| !matches!(c, '.' | '\'' | '\u{2019}'))
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(ToString::to_string)
        .collect()
}

fn expand_tokens(tokens: Vec<String>, table: &[(&str, &str)]) -> String {
    tokens
        .into_iter()
        .map(|token| {
            table
                .iter()
                .find(|(abbr, _)| *abbr == token)
                .map(|(_, full)| full.to_string())
                .unwrap_or(token)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_street(street: &str) -> String {
    expand_tokens(clean_tokens(street), STREET_TOKENS)
}

fn normalize_city(city: &str) -> String {
    expand_tokens(clean_tokens(city), CITY_TOKENS)
}

fn normalize_state(state: &str) -> String {
    let cleaned = clean_tokens(state).join(" ");
    if cleaned.len() == 2 && STATES.iter().any(|(_, code)| *code == cleaned) {
        return cleaned;
    }
    STATES
        .iter()
        .find(|(name, _)| *name == cleaned)
        .map(|(_, code)| code.to_string())
        .unwrap_or_default()
}

fn normalize_zip(zip: &str) -> String {
    let digits = zip
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>();
    if digits.len() >= 5 {
        digits[..5].to_string()
    } else {
        String::new()
    }
}
