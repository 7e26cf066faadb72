//! Turns noisy model output into typed records.
//!
//! Cleanup isolates the first balanced JSON object in the text. Extraction then
//! tries a fixed list of shape strategies and keeps the first non-empty result.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::models::{AiCityResponse, AiItineraryResponse, GeneralCityData, PoiDetail};

/// Marker of an itinerary payload, which is persisted through another path.
pub const ITINERARY_NAME_MARKER: &str = "\"itinerary_name\"";

static FENCED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("fenced block pattern")
});
static TRAILING_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",\s*([}\]])").expect("trailing comma pattern"));

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("no JSON object found in model output")]
    NoJsonObject,
    #[error("model output is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model output carries no city name or description")]
    MissingCityData,
}

pub type ParseStrategy = fn(&str) -> Option<Vec<PoiDetail>>;

/// Shape strategies in the order they are attempted.
pub const POI_STRATEGIES: &[(&str, ParseStrategy)] = &[
    ("wrapped_city_response", parse_wrapped_city_response),
    ("city_response", parse_city_response),
    ("loose_collections", parse_loose_collections),
    ("single_poi", parse_single_poi),
];

pub fn clean_json_response(raw: &str) -> String {
    let mut text = raw.trim();

    let fenced;
    if text.contains("```") {
        fenced = extract_fenced(text);
        text = fenced.trim();
    }

    let Some(start) = text.find('{') else {
        return strip_noise(text);
    };

    let end = matching_brace(text, start).or_else(|| text.rfind('}'));
    let sliced = match end {
        Some(end) if end > start => &text[start..=end],
        _ => &text[start..],
    };

    strip_noise(sliced)
}

/// Cleans `raw` and decodes it into `T`.
pub fn decode_json<T: DeserializeOwned>(raw: &str) -> Result<T, NormalizeError> {
    let cleaned = clean_json_response(raw);
    if !cleaned.starts_with('{') {
        return Err(NormalizeError::NoJsonObject);
    }
    Ok(serde_json::from_str(&cleaned)?)
}

/// Never fails: an unrecognised payload yields an empty list.
pub fn extract_pois(raw: &str) -> Vec<PoiDetail> {
    let cleaned = clean_json_response(raw);
    if cleaned.contains(ITINERARY_NAME_MARKER) {
        debug!("itinerary payload detected, skipping POI extraction");
        return Vec::new();
    }

    for (name, strategy) in POI_STRATEGIES {
        if let Some(pois) = strategy(&cleaned) {
            if !pois.is_empty() {
                debug!(strategy = name, count = pois.len(), "extracted POIs");
                return pois;
            }
        }
    }

    debug!(
        preview = %cleaned.chars().take(120).collect::<String>(),
        "no POI shape matched, returning empty list"
    );
    Vec::new()
}

/// Decodes an itinerary payload: bare, nested under `itinerary_response`, or
/// wrapped in `data`. Returns `None` for anything without the itinerary marker.
pub fn extract_itinerary(raw: &str) -> Option<AiItineraryResponse> {
    let cleaned = clean_json_response(raw);
    if !cleaned.contains(ITINERARY_NAME_MARKER) {
        return None;
    }

    let value: serde_json::Value = serde_json::from_str(&cleaned).ok()?;
    let node = value.get("data").unwrap_or(&value);
    let node = node.get("itinerary_response").unwrap_or(node);
    serde_json::from_value(node.clone()).ok()
}

/// Decodes city facts, bare or nested under `data` and/or `general_city_data`.
/// An object naming neither a city nor a description is rejected.
pub fn extract_city_data(raw: &str) -> Result<GeneralCityData, NormalizeError> {
    let value: serde_json::Value = decode_json(raw)?;
    let node = value.get("data").unwrap_or(&value);
    let node = node.get("general_city_data").unwrap_or(node);

    let city: GeneralCityData = serde_json::from_value(node.clone())?;
    if city.city.trim().is_empty() && city.description.trim().is_empty() {
        return Err(NormalizeError::MissingCityData);
    }
    Ok(city)
}

pub fn parse_wrapped_city_response(text: &str) -> Option<Vec<PoiDetail>> {
    #[derive(Deserialize)]
    struct Wrapper {
        data: AiCityResponse,
    }

    let wrapper: Wrapper = serde_json::from_str(text).ok()?;
    Some(city_response_pois(wrapper.data))
}

pub fn parse_city_response(text: &str) -> Option<Vec<PoiDetail>> {
    let response: AiCityResponse = serde_json::from_str(text).ok()?;
    Some(city_response_pois(response))
}

pub fn parse_loose_collections(text: &str) -> Option<Vec<PoiDetail>> {
    #[derive(Deserialize)]
    struct Collections {
        activities: Option<Vec<PoiDetail>>,
        hotels: Option<Vec<PoiDetail>>,
        restaurants: Option<Vec<PoiDetail>>,
        points_of_interest: Option<Vec<PoiDetail>>,
    }

    let collections: Collections = serde_json::from_str(text).ok()?;
    let pois = [
        collections.activities,
        collections.hotels,
        collections.restaurants,
        collections.points_of_interest,
    ]
    .into_iter()
    .flatten()
    .flatten()
    .collect::<Vec<_>>();

    Some(pois)
}

pub fn parse_single_poi(text: &str) -> Option<Vec<PoiDetail>> {
    let poi: PoiDetail = serde_json::from_str(text).ok()?;
    if poi.name.trim().is_empty() {
        return None;
    }
    Some(vec![poi])
}

fn city_response_pois(response: AiCityResponse) -> Vec<PoiDetail> {
    let mut pois = response.points_of_interest;
    pois.extend(response.itinerary_response.points_of_interest);
    pois
}

fn extract_fenced(text: &str) -> String {
    if let Some(inner) = FENCED_BLOCK
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
    {
        return inner.to_string();
    }

    let mut stripped = text.trim();
    if let Some(rest) = stripped.strip_prefix("```") {
        stripped = rest.strip_prefix("json").unwrap_or(rest);
    }
    stripped = stripped.strip_suffix("```").unwrap_or(stripped);
    stripped.to_string()
}

/// Byte index of the brace closing the one at `start`, ignoring braces in strings.
fn matching_brace(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, byte) in text.as_bytes()[start..].iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }

    None
}

fn strip_noise(text: &str) -> String {
    let without_ticks = text.replace('`', "");
    TRAILING_COMMA
        .replace_all(without_ticks.trim(), "$1")
        .into_owned()
}
