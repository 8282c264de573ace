//! Per-service extraction tables.
//!
//! Every scraper writes items shaped as
//! `{ id, title, type, external_ids: {service: id}, metadata: {...} }`.
//! The generic fields are read the same way for every service; the tables
//! below add the service-specific metadata fields that carry foreign ids or
//! season offsets. Supporting a new field is a table change, not a code change.

use shared::Service;

/// Path to the record's own id
pub const ID_PATH: &[&str] = &["id"];

/// Path to the raw type label
pub const TYPE_PATH: &[&str] = &["type"];

/// Object of `{service-alias: id}` cross-links, present on every service
pub const EXTERNAL_IDS_PATH: &[&str] = &["external_ids"];

/// Fields holding a title string, or an object/array of title strings
pub const TITLE_PATHS: &[&[&str]] = &[
    &["title"],
    &["metadata", "titles"],
    &["metadata", "name"],
    &["metadata", "original_name"],
];

/// Fields holding an episode (or chapter) count
pub const EPISODE_PATHS: &[&[&str]] = &[
    &["metadata", "episodes"],
    &["metadata", "episode_count"],
    &["metadata", "chapter_count"],
];

/// Fields holding a start/air date, either ISO text or `{year, month, day}`
pub const DATE_PATHS: &[&[&str]] = &[
    &["metadata", "start_date"],
    &["metadata", "started_at"],
    &["metadata", "first_air_date"],
    &["metadata", "first_aired"],
    &["metadata", "aired", "from"],
];

/// How an id is laid out inside its field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdShape {
    /// The whole value is one id
    Single,
    /// A comma-separated list; only the first entry is used
    FirstOfList,
}

/// A metadata field carrying an id of another service
#[derive(Debug, Clone, Copy)]
pub struct HintRule {
    pub path: &'static [&'static str],
    pub target: Service,
    pub shape: IdShape,
}

/// Which season offset a field feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeasonSlot {
    Tvdb,
    Tmdb,
}

/// A metadata field carrying a season offset
#[derive(Debug, Clone, Copy)]
pub struct SeasonRule {
    pub path: &'static [&'static str],
    pub slot: SeasonSlot,
}

/// Extraction rules for one service
#[derive(Debug)]
pub struct ServiceProfile {
    pub service: Service,
    /// Applied after `external_ids`; earlier rules win for the same target
    pub hint_rules: &'static [HintRule],
    pub season_rules: &'static [SeasonRule],
}

const fn hint(path: &'static [&'static str], target: Service, shape: IdShape) -> HintRule {
    HintRule { path, target, shape }
}

const fn plain(service: Service) -> ServiceProfile {
    ServiceProfile {
        service,
        hint_rules: &[],
        season_rules: &[],
    }
}

static PROFILES: [ServiceProfile; 11] = [
    // anime-lists XML attributes copied into metadata by the AniDB scraper
    ServiceProfile {
        service: Service::Anidb,
        hint_rules: &[
            hint(&["metadata", "tvdb_id"], Service::Tvdb, IdShape::Single),
            hint(&["metadata", "tmdb_tv"], Service::Tmdb, IdShape::Single),
            hint(&["metadata", "tmdb_id"], Service::Tmdb, IdShape::FirstOfList),
            hint(&["metadata", "imdb_id"], Service::Imdb, IdShape::FirstOfList),
        ],
        season_rules: &[
            SeasonRule {
                path: &["metadata", "default_tvdb_season"],
                slot: SeasonSlot::Tvdb,
            },
            SeasonRule {
                path: &["metadata", "tmdb_season"],
                slot: SeasonSlot::Tmdb,
            },
        ],
    },
    plain(Service::Anilist),
    plain(Service::Mal),
    plain(Service::AnimeNewsNetwork),
    plain(Service::AnimePlanet),
    plain(Service::Kitsu),
    plain(Service::Livechart),
    ServiceProfile {
        service: Service::Simkl,
        hint_rules: &[
            hint(&["metadata", "ids", "mal"], Service::Mal, IdShape::Single),
            hint(&["metadata", "ids", "anilist"], Service::Anilist, IdShape::Single),
            hint(&["metadata", "ids", "anidb"], Service::Anidb, IdShape::Single),
            hint(&["metadata", "ids", "tmdb"], Service::Tmdb, IdShape::Single),
            hint(&["metadata", "ids", "imdb"], Service::Imdb, IdShape::Single),
        ],
        season_rules: &[],
    },
    plain(Service::Tmdb),
    plain(Service::Tvdb),
    plain(Service::Imdb),
];

/// Look up the extraction rules for a service
pub fn profile(service: Service) -> Option<&'static ServiceProfile> {
    PROFILES.iter().find(|profile| profile.service == service)
}
