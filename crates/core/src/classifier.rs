use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    AddPoi,
    RemovePoi,
    AskQuestion,
    ModifyItinerary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Itinerary,
    Accommodation,
    Dining,
    Activities,
    General,
}

impl Domain {
    /// Lower wins when several domains match.
    pub fn priority(self) -> u8 {
        match self {
            Self::Itinerary => 1,
            Self::Accommodation => 2,
            Self::Dining => 3,
            Self::Activities => 4,
            Self::General => 5,
        }
    }

    pub fn as_code(self) -> &'static str {
        match self {
            Self::Itinerary => "itinerary",
            Self::Accommodation => "accommodation",
            Self::Dining => "dining",
            Self::Activities => "activities",
            Self::General => "general",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "itinerary" => Some(Self::Itinerary),
            "accommodation" => Some(Self::Accommodation),
            "dining" => Some(Self::Dining),
            "activities" => Some(Self::Activities),
            "general" => Some(Self::General),
            _ => None,
        }
    }

    /// Dining, accommodation and activities replies are not itineraries.
    pub fn is_domain_specific(self) -> bool {
        matches!(self, Self::Accommodation | Self::Dining | Self::Activities)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub domain: Domain,
    pub intent: Intent,
}

const INTENT_GROUPS: &[(Intent, &[&str])] = &[
    (Intent::AddPoi, &["add", "include", "visit"]),
    (Intent::RemovePoi, &["remove", "delete", "skip"]),
    (
        Intent::AskQuestion,
        &["what", "where", "how", "why", "when"],
    ),
];

const DOMAIN_KEYWORDS: &[(Domain, &[&str])] = &[
    (
        Domain::Itinerary,
        &[
            "itinerary",
            "itineraries",
            "plan my trip",
            "plan a trip",
            "trip plan",
            "trip plans",
            "travel plan",
            "travel plans",
            "day trip",
            "day trips",
            "schedule",
            "route",
            "routes",
        ],
    ),
    (
        Domain::Accommodation,
        &[
            "hotel",
            "hotels",
            "hostel",
            "hostels",
            "accommodation",
            "accommodations",
            "lodging",
            "motel",
            "motels",
            "resort",
            "resorts",
            "airbnb",
            "place to stay",
            "places to stay",
            "where to stay",
            "bed and breakfast",
        ],
    ),
    (
        Domain::Dining,
        &[
            "restaurant",
            "restaurants",
            "food",
            "foods",
            "eat",
            "eating",
            "dining",
            "dinner",
            "dinners",
            "lunch",
            "lunches",
            "breakfast",
            "brunch",
            "cafe",
            "cafes",
            "cuisine",
            "cuisines",
            "bistro",
            "bistros",
        ],
    ),
    (
        Domain::Activities,
        &[
            "activity",
            "activities",
            "museum",
            "museums",
            "tour",
            "tours",
            "attraction",
            "attractions",
            "things to do",
            "sightseeing",
            "hike",
            "hikes",
            "hiking",
            "park",
            "parks",
            "nightlife",
            "shopping",
            "excursion",
            "excursions",
        ],
    ),
];

/// Keyword classifier for chat messages. Built once, then shared read-only.
#[derive(Debug, Clone)]
pub struct MessageClassifier {
    intents: Vec<(Intent, Regex)>,
    domains: RegexSet,
    domain_order: Vec<Domain>,
}

impl MessageClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        let intents = INTENT_GROUPS
            .iter()
            .map(|(intent, words)| Ok((*intent, Regex::new(&word_alternation(words))?)))
            .collect::<Result<Vec<_>, regex::Error>>()?;

        let domains = RegexSet::new(
            DOMAIN_KEYWORDS
                .iter()
                .map(|(_, words)| word_alternation(words)),
        )?;
        let domain_order = DOMAIN_KEYWORDS.iter().map(|(domain, _)| *domain).collect();

        Ok(Self {
            intents,
            domains,
            domain_order,
        })
    }

    pub fn classify(&self, message: &str) -> Classification {
        let lower = normalize_text(message).to_lowercase();
        Classification {
            domain: self.domain_of(&lower),
            intent: self.intent_of(&lower),
        }
    }

    pub fn intent(&self, message: &str) -> Intent {
        self.intent_of(&normalize_text(message).to_lowercase())
    }

    pub fn domain(&self, message: &str) -> Domain {
        self.domain_of(&normalize_text(message).to_lowercase())
    }

    fn intent_of(&self, lower: &str) -> Intent {
        self.intents
            .iter()
            .find(|(_, pattern)| pattern.is_match(lower))
            .map(|(intent, _)| *intent)
            .unwrap_or(Intent::ModifyItinerary)
    }

    fn domain_of(&self, lower: &str) -> Domain {
        self.domains
            .matches(lower)
            .into_iter()
            .map(|idx| self.domain_order[idx])
            .min_by_key(|domain| domain.priority())
            .unwrap_or(Domain::General)
    }
}

pub fn normalize_text(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

fn word_alternation(words: &[&str]) -> String {
    let escaped = words
        .iter()
        .map(|word| regex::escape(word))
        .collect::<Vec<_>>()
        .join("|");
    format!(r"(?i)\b(?:{escaped})\b")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> MessageClassifier {
        MessageClassifier::new().unwrap()
    }

    #[test]
    fn itinerary_beats_accommodation_in_any_order() {
        let clf = classifier();
        assert_eq!(
            clf.domain("Find me a hotel and plan my trip"),
            Domain::Itinerary
        );
        assert_eq!(
            clf.domain("plan my trip, then book a hotel"),
            Domain::Itinerary
        );
    }

    #[test]
    fn accommodation_beats_dining() {
        assert_eq!(
            classifier().domain("hotels near good restaurants"),
            Domain::Accommodation
        );
    }

    #[test]
    fn plurals_are_matched() {
        let clf = classifier();
        assert_eq!(clf.domain("any good cafes around?"), Domain::Dining);
        assert_eq!(clf.domain("MUSEUMS please"), Domain::Activities);
    }

    #[test]
    fn unknown_text_is_general() {
        assert_eq!(classifier().domain("hello there"), Domain::General);
    }

    #[test]
    fn intent_matches_whole_words_only() {
        let clf = classifier();
        assert_eq!(clf.intent("Please ADD the Louvre"), Intent::AddPoi);
        // "address" contains "add" but is not the word.
        assert_eq!(clf.intent("change the address"), Intent::ModifyItinerary);
        assert_eq!(clf.intent("skip the tower"), Intent::RemovePoi);
    }

    #[test]
    fn intent_groups_follow_fixed_priority() {
        let clf = classifier();
        assert_eq!(clf.intent("what should I remove"), Intent::RemovePoi);
        assert_eq!(clf.intent("where can I visit"), Intent::AddPoi);
        assert_eq!(clf.intent("why is it closed"), Intent::AskQuestion);
    }

    #[test]
    fn classify_reports_both_axes() {
        let result = classifier().classify("  remove   the museum ");
        assert_eq!(result.domain, Domain::Activities);
        assert_eq!(result.intent, Intent::RemovePoi);
    }

    #[test]
    fn classifier_is_shareable_across_threads() {
        let clf = std::sync::Arc::new(classifier());
        let handles = (0..4)
            .map(|_| {
                let clf = clf.clone();
                std::thread::spawn(move || clf.domain("book a hotel"))
            })
            .collect::<Vec<_>>();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Domain::Accommodation);
        }
    }
}
