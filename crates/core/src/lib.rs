pub mod classifier;
pub mod geo;
pub mod models;
pub mod normalize;
pub mod prompts;

pub use classifier::{normalize_text, Classification, Domain, Intent, MessageClassifier};
pub use geo::haversine_distance_meters;
pub use models::*;
pub use normalize::{
    clean_json_response, decode_json, extract_city_data, extract_itinerary, extract_pois,
    NormalizeError,
};
