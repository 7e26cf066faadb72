use crate::classifier::Domain;
use crate::models::{AiItineraryResponse, TravelProfile};

pub const DINING_PROMPT_MARKER: &str = "Generate personalized restaurant recommendations";
pub const ACCOMMODATION_PROMPT_MARKER: &str = "Generate personalized hotel recommendations";
pub const ACTIVITIES_PROMPT_MARKER: &str = "Generate personalized activity recommendations";

const POI_FIELDS: &str = r#"{"name": string, "latitude": number, "longitude": number, "category": string, "description_poi": string, "address": string, "website": string, "opening_hours": string}"#;

/// Domain of a reply, recovered from the literal markers in its prompt.
pub fn reply_domain_from_prompt(prompt: &str) -> Option<Domain> {
    if prompt.contains(DINING_PROMPT_MARKER) {
        Some(Domain::Dining)
    } else if prompt.contains(ACCOMMODATION_PROMPT_MARKER) {
        Some(Domain::Accommodation)
    } else if prompt.contains(ACTIVITIES_PROMPT_MARKER) {
        Some(Domain::Activities)
    } else {
        None
    }
}

pub fn city_description_prompt(city: &str) -> String {
    format!(
        "Describe the city of {city} for a traveller. Respond with a single JSON object and nothing else, \
         using the keys: city, country, state_province, description, center_latitude, center_longitude, \
         population, area, timezone, language, weather, attractions, history."
    )
}

pub fn generic_pois_prompt(city: &str) -> String {
    format!(
        "List 10 well-known points of interest in {city}. Respond with a single JSON object of the form \
         {{\"points_of_interest\": [{POI_FIELDS}]}} and nothing else. Coordinates are WGS84 decimal degrees."
    )
}

pub fn personalized_itinerary_prompt(city: &str, profile: &TravelProfile) -> String {
    format!(
        "Create a personalised one-day itinerary in {city} for a traveller.\n{}\n\
         Respond with a single JSON object of the form {{\"itinerary_name\": string, \
         \"overall_description\": string, \"points_of_interest\": [{POI_FIELDS}]}} and nothing else. \
         Order the points of interest in visiting order.",
        profile_lines(profile)
    )
}

pub fn domain_prompt(domain: Domain, city: &str, profile: &TravelProfile, request: &str) -> String {
    let (marker, collection, noun) = match domain {
        Domain::Dining => (DINING_PROMPT_MARKER, "restaurants", "restaurants"),
        Domain::Accommodation => (ACCOMMODATION_PROMPT_MARKER, "hotels", "places to stay"),
        _ => (ACTIVITIES_PROMPT_MARKER, "activities", "activities"),
    };

    let near = profile
        .location
        .map(|point| format!(" near latitude {}, longitude {}", point.latitude, point.longitude))
        .unwrap_or_default();

    format!(
        "{marker} for {city}{near}.\n{}\nUser request: {request}\n\
         Suggest up to 8 {noun}. Respond with a single JSON object of the form \
         {{\"{collection}\": [{POI_FIELDS}]}} and nothing else.",
        profile_lines(profile)
    )
}

pub fn poi_detail_prompt(city: &str, request: &str) -> String {
    format!(
        "A traveller in {city} wants to add a place to their itinerary: \"{request}\". \
         Identify the place and respond with a single JSON object {POI_FIELDS} and nothing else."
    )
}

pub fn question_prompt(city: &str, itinerary: Option<&AiItineraryResponse>, question: &str) -> String {
    let context = itinerary
        .map(|it| {
            let stops = it
                .points_of_interest
                .iter()
                .map(|poi| poi.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            format!("Current itinerary \"{}\": {stops}.\n", it.itinerary_name)
        })
        .unwrap_or_default();

    format!(
        "You are a concise travel assistant for {city}.\n{context}Answer the traveller's question in \
         plain text, at most 120 words: {question}"
    )
}

pub fn itinerary_revision_prompt(
    city: &str,
    profile: &TravelProfile,
    current: Option<&AiItineraryResponse>,
    request: &str,
) -> String {
    let current_json = current
        .and_then(|it| serde_json::to_string(it).ok())
        .unwrap_or_else(|| "none".to_string());

    format!(
        "Revise the traveller's itinerary in {city}.\n{}\nCurrent itinerary JSON: {current_json}\n\
         Requested change: {request}\nRespond with the full revised itinerary as a single JSON object of \
         the form {{\"itinerary_name\": string, \"overall_description\": string, \
         \"points_of_interest\": [{POI_FIELDS}]}} and nothing else.",
        profile_lines(profile)
    )
}

fn profile_lines(profile: &TravelProfile) -> String {
    let mut lines = Vec::new();
    if !profile.interests.is_empty() {
        lines.push(format!("Interests: {}.", profile.interests.join(", ")));
    }
    if !profile.tags.is_empty() {
        lines.push(format!("Tags: {}.", profile.tags.join(", ")));
    }
    if !profile.preferences.is_empty() {
        lines.push(format!("Preferences: {}.", profile.preferences.join(", ")));
    }
    if lines.is_empty() {
        lines.push("No stated preferences.".to_string());
    }
    lines.join("\n")
}
