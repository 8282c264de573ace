//! Raw payload normalization.
//!
//! Turns a loosely-typed scraper item into a [`ServiceRecord`]: the record's
//! own canonical id, its media type, the foreign ids it claims, and the few
//! attributes a reviewer needs to tell two titles apart.

use crate::registry::{self, IdShape, SeasonSlot};
use crate::source::RawPayload;
use chrono::NaiveDate;
use serde_json::Value;
use shared::{MediaKind, MediaType, SeasonInfo, Service, TypeLabel};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// One title as seen from one service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRecord {
    pub service: Service,
    pub native_id: String,
    pub media_type: Option<MediaType>,
    /// Candidate ids on other services, possibly wrong
    pub foreign_id_hints: BTreeMap<Service, String>,
    pub title_variants: Vec<String>,
    pub season_hint: Option<SeasonInfo>,
    pub episodes: Option<u32>,
    pub aired: Option<NaiveDate>,
}

/// Why a payload could not become a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SkipReason {
    MalformedPayload,
    UnsupportedMediaType,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MalformedPayload => write!(f, "malformed_payload"),
            SkipReason::UnsupportedMediaType => write!(f, "unsupported_media_type"),
        }
    }
}

/// Normalization failures; each one skips a single payload
#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("malformed {service} payload: {reason}")]
    MalformedPayload { service: Service, reason: String },

    #[error("{service} {native_id} has media type '{label}', unsupported in a {kind} pass")]
    UnsupportedMediaType {
        service: Service,
        native_id: String,
        label: String,
        kind: MediaKind,
    },
}

impl NormalizeError {
    pub fn reason(&self) -> SkipReason {
        match self {
            NormalizeError::MalformedPayload { .. } => SkipReason::MalformedPayload,
            NormalizeError::UnsupportedMediaType { .. } => SkipReason::UnsupportedMediaType,
        }
    }
}

/// Converts raw payloads for one media kind
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    kind: MediaKind,
}

impl Normalizer {
    pub fn new(kind: MediaKind) -> Self {
        Self { kind }
    }

    /// Normalize one payload. Pure; absent optional fields are tolerated.
    pub fn normalize(&self, payload: &RawPayload) -> Result<ServiceRecord, NormalizeError> {
        let service = payload.service;
        let fields = &payload.fields;

        if !self.kind.includes(service) {
            return Err(NormalizeError::MalformedPayload {
                service,
                reason: format!("service is not part of a {} pass", self.kind),
            });
        }

        let native_id = lookup(fields, registry::ID_PATH)
            .and_then(|value| canonical_id(service, value))
            .ok_or_else(|| NormalizeError::MalformedPayload {
                service,
                reason: "missing or invalid native id".to_string(),
            })?;

        let media_type = match lookup(fields, registry::TYPE_PATH) {
            Some(Value::String(label)) => match MediaType::parse_label(label) {
                TypeLabel::Absent => None,
                TypeLabel::Untyped(kind) if kind == self.kind => None,
                TypeLabel::Known(media_type) if media_type.kind() == self.kind => Some(media_type),
                TypeLabel::Known(_) | TypeLabel::Untyped(_) | TypeLabel::Unrecognized => {
                    return Err(NormalizeError::UnsupportedMediaType {
                        service,
                        native_id,
                        label: label.clone(),
                        kind: self.kind,
                    });
                }
            },
            _ => None,
        };

        Ok(ServiceRecord {
            foreign_id_hints: self.extract_hints(service, &native_id, fields),
            season_hint: extract_season(service, fields),
            title_variants: extract_titles(fields),
            episodes: registry::EPISODE_PATHS
                .iter()
                .find_map(|path| lookup(fields, path).and_then(Value::as_u64))
                .and_then(|count| u32::try_from(count).ok()),
            aired: registry::DATE_PATHS
                .iter()
                .find_map(|path| lookup(fields, path).and_then(parse_date)),
            service,
            native_id,
            media_type,
        })
    }

    fn extract_hints(
        &self,
        service: Service,
        native_id: &str,
        fields: &Value,
    ) -> BTreeMap<Service, String> {
        let mut hints = BTreeMap::new();

        let mut offer = |target: Service, value: &Value, shape: IdShape| {
            if target == service || !self.kind.includes(target) || hints.contains_key(&target) {
                return;
            }
            let value = match (shape, value) {
                (IdShape::FirstOfList, Value::String(list)) => {
                    Value::String(list.split(',').next().unwrap_or_default().to_string())
                }
                _ => value.clone(),
            };
            match canonical_id(target, &value) {
                Some(id) => {
                    hints.insert(target, id);
                }
                None => debug!(
                    %service,
                    native_id,
                    %target,
                    value = %value,
                    "Ignoring unusable foreign id"
                ),
            }
        };

        if let Some(Value::Object(external)) = lookup(fields, registry::EXTERNAL_IDS_PATH) {
            for (name, value) in external {
                if let Some(target) = Service::from_alias(name) {
                    offer(target, value, IdShape::Single);
                }
            }
        }

        if let Some(profile) = registry::profile(service) {
            for rule in profile.hint_rules {
                if let Some(value) = lookup(fields, rule.path) {
                    offer(rule.target, value, rule.shape);
                }
            }
        }

        hints
    }
}

/// Canonical form of an id for `service`, or None if the value is not an id.
///
/// Numeric services accept integers or digit strings and drop leading zeros.
/// IMDb ids are lower-cased and must look like `tt1234`.
pub fn canonical_id(service: Service, value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.as_u64()?.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        return None;
    }

    match service {
        Service::Imdb => {
            let lowered = text.to_ascii_lowercase();
            let digits = lowered.strip_prefix("tt")?;
            (!digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())).then_some(lowered)
        }
        Service::AnimePlanet => Some(text),
        _ => text.parse::<u64>().ok().map(|id| id.to_string()),
    }
}

fn lookup<'a>(fields: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(fields, |value, key| value.get(key))
        .filter(|value| !value.is_null())
}

fn extract_season(service: Service, fields: &Value) -> Option<SeasonInfo> {
    let profile = registry::profile(service)?;
    let mut season = SeasonInfo::default();

    for rule in profile.season_rules {
        let number = lookup(fields, rule.path).and_then(|value| match value {
            Value::String(s) => s.trim().parse::<u32>().ok(),
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        });
        // "a" (absolute numbering) and "0" (specials) carry no season
        let Some(number) = number.filter(|n| *n > 0) else {
            continue;
        };
        match rule.slot {
            SeasonSlot::Tvdb => season.tvdb = season.tvdb.or(Some(number)),
            SeasonSlot::Tmdb => season.tmdb = season.tmdb.or(Some(number)),
        }
    }

    (!season.is_empty()).then_some(season)
}

fn extract_titles(fields: &Value) -> Vec<String> {
    let mut titles: Vec<String> = Vec::new();

    fn collect(value: &Value, titles: &mut Vec<String>) {
        match value {
            Value::String(s) => {
                let s = s.trim();
                if !s.is_empty() && !titles.iter().any(|t| t == s) {
                    titles.push(s.to_string());
                }
            }
            Value::Array(items) => items.iter().for_each(|item| collect(item, titles)),
            Value::Object(map) => map.values().for_each(|item| collect(item, titles)),
            _ => {}
        }
    }

    for path in registry::TITLE_PATHS {
        if let Some(value) = lookup(fields, path) {
            collect(value, &mut titles);
        }
    }

    titles
}

fn parse_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::String(s) => s
            .get(..10)
            .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()),
        Value::Object(parts) => {
            let year = parts.get("year")?.as_i64()?;
            let month = parts.get("month").and_then(Value::as_u64).unwrap_or(1);
            let day = parts.get("day").and_then(Value::as_u64).unwrap_or(1);
            NaiveDate::from_ymd_opt(
                i32::try_from(year).ok()?,
                u32::try_from(month).ok()?,
                u32::try_from(day).ok()?,
            )
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(service: Service, fields: Value) -> RawPayload {
        RawPayload { service, fields }
    }

    #[test]
    fn test_anilist_payload() {
        let raw = payload(
            Service::Anilist,
            json!({
                "id": "290",
                "title": "Cowboy Bebop",
                "type": "TV",
                "external_ids": {"anilist": "290", "mal": "1", "anidb": "23", "themoviedb": "30991", "crunchyroll": "x"},
                "metadata": {
                    "titles": {"romaji": "Cowboy Bebop", "native": "カウボーイビバップ"},
                    "episodes": 26,
                    "start_date": {"year": 1998, "month": 4, "day": 3}
                }
            }),
        );

        let record = Normalizer::new(MediaKind::Anime).normalize(&raw).unwrap();
        assert_eq!(record.native_id, "290");
        assert_eq!(record.media_type, Some(MediaType::Tv));
        assert_eq!(record.foreign_id_hints.get(&Service::Mal), Some(&"1".to_string()));
        assert_eq!(record.foreign_id_hints.get(&Service::Anidb), Some(&"23".to_string()));
        assert_eq!(record.foreign_id_hints.get(&Service::Tmdb), Some(&"30991".to_string()));
        // own service is never a hint
        assert!(!record.foreign_id_hints.contains_key(&Service::Anilist));
        assert_eq!(record.title_variants, vec!["Cowboy Bebop", "カウボーイビバップ"]);
        assert_eq!(record.episodes, Some(26));
        assert_eq!(record.aired, NaiveDate::from_ymd_opt(1998, 4, 3));
        assert_eq!(record.season_hint, None);
    }

    #[test]
    fn test_anidb_metadata_rules() {
        let raw = payload(
            Service::Anidb,
            json!({
                "id": "0023",
                "title": "Cowboy Bebop",
                "type": "",
                "external_ids": {"anidb": "23"},
                "metadata": {
                    "name": "Cowboy Bebop",
                    "tvdb_id": "76885",
                    "default_tvdb_season": "1",
                    "tmdb_tv": null,
                    "tmdb_id": "30991,11111",
                    "tmdb_season": "a",
                    "imdb_id": "TT0213338"
                }
            }),
        );

        let record = Normalizer::new(MediaKind::Anime).normalize(&raw).unwrap();
        assert_eq!(record.native_id, "23");
        assert_eq!(record.media_type, None);
        assert_eq!(record.foreign_id_hints.get(&Service::Tvdb), Some(&"76885".to_string()));
        assert_eq!(record.foreign_id_hints.get(&Service::Tmdb), Some(&"30991".to_string()));
        assert_eq!(record.foreign_id_hints.get(&Service::Imdb), Some(&"tt0213338".to_string()));
        assert_eq!(record.season_hint, Some(SeasonInfo { tvdb: Some(1), tmdb: None }));
    }

    #[test]
    fn test_non_numeric_hints_dropped() {
        let raw = payload(
            Service::Anidb,
            json!({"id": 5, "metadata": {"tvdb_id": "movie", "default_tvdb_season": "0"}}),
        );

        let record = Normalizer::new(MediaKind::Anime).normalize(&raw).unwrap();
        assert!(record.foreign_id_hints.is_empty());
        assert_eq!(record.season_hint, None);
    }

    #[test]
    fn test_missing_id_is_malformed() {
        let raw = payload(Service::Kitsu, json!({"title": "No id"}));
        let err = Normalizer::new(MediaKind::Anime).normalize(&raw).unwrap_err();
        assert_eq!(err.reason(), SkipReason::MalformedPayload);

        let raw = payload(Service::Mal, json!({"id": "abc"}));
        let err = Normalizer::new(MediaKind::Anime).normalize(&raw).unwrap_err();
        assert_eq!(err.reason(), SkipReason::MalformedPayload);
    }

    #[test]
    fn test_unsupported_media_type() {
        let raw = payload(Service::Anilist, json!({"id": 1, "type": "PODCAST"}));
        let err = Normalizer::new(MediaKind::Anime).normalize(&raw).unwrap_err();
        assert_eq!(err.reason(), SkipReason::UnsupportedMediaType);

        // manga types are not accepted in an anime pass
        let raw = payload(Service::Anilist, json!({"id": 1, "type": "MANGA"}));
        let err = Normalizer::new(MediaKind::Anime).normalize(&raw).unwrap_err();
        assert_eq!(err.reason(), SkipReason::UnsupportedMediaType);

        // an OEL label belongs to manga
        let raw = payload(Service::Mal, json!({"id": 1, "type": "OEL"}));
        let err = Normalizer::new(MediaKind::Anime).normalize(&raw).unwrap_err();
        assert_eq!(err.reason(), SkipReason::UnsupportedMediaType);
    }

    #[test]
    fn test_scraper_type_labels() {
        let normalizer = Normalizer::new(MediaKind::Anime);

        let raw = payload(
            Service::AnimeNewsNetwork,
            json!({"id": 77, "type": "OAV", "external_ids": {"anidb": 1}}),
        );
        let record = normalizer.normalize(&raw).unwrap();
        assert_eq!(record.media_type, Some(MediaType::Ova));
        assert_eq!(record.foreign_id_hints.get(&Service::Anidb), Some(&"1".to_string()));

        let raw = payload(Service::AnimePlanet, json!({"id": "bebop-special", "type": "DVD Special"}));
        assert_eq!(normalizer.normalize(&raw).unwrap().media_type, Some(MediaType::Special));

        for label in ["CM", "PV", "Other", "TVEPISODE", "SHORT"] {
            let raw = payload(Service::Mal, json!({"id": 5, "type": label, "external_ids": {"anidb": 2}}));
            let record = normalizer.normalize(&raw).unwrap();
            assert_eq!(record.media_type, None, "{label}");
            assert_eq!(record.foreign_id_hints.len(), 1);
        }

        let raw = payload(Service::Mal, json!({"id": 9, "type": "OEL"}));
        let record = Normalizer::new(MediaKind::Manga).normalize(&raw).unwrap();
        assert_eq!(record.media_type, None);
    }

    #[test]
    fn test_manga_pass_filters_services() {
        let raw = payload(
            Service::Anilist,
            json!({
                "id": 30013,
                "type": "MANGA",
                "external_ids": {"mal": "13", "animeplanet": "one-piece", "kitsu": "38"}
            }),
        );

        let record = Normalizer::new(MediaKind::Manga).normalize(&raw).unwrap();
        assert_eq!(record.media_type, Some(MediaType::Manga));
        assert_eq!(record.foreign_id_hints.len(), 2);
        assert!(!record.foreign_id_hints.contains_key(&Service::AnimePlanet));

        let raw = payload(Service::Tvdb, json!({"id": 1}));
        assert!(Normalizer::new(MediaKind::Manga).normalize(&raw).is_err());
    }

    #[test]
    fn test_simkl_nested_ids() {
        let raw = payload(
            Service::Simkl,
            json!({"id": "37089", "metadata": {"ids": {"mal": 1, "anidb": "23", "imdb": "tt0213338"}}}),
        );

        let record = Normalizer::new(MediaKind::Anime).normalize(&raw).unwrap();
        assert_eq!(record.foreign_id_hints.len(), 3);
        assert_eq!(record.foreign_id_hints.get(&Service::Mal), Some(&"1".to_string()));
    }

    #[test]
    fn test_canonical_ids() {
        assert_eq!(canonical_id(Service::Mal, &json!(" 007 ")), Some("7".to_string()));
        assert_eq!(canonical_id(Service::Mal, &json!(-3)), None);
        assert_eq!(canonical_id(Service::Mal, &json!(1.5)), None);
        assert_eq!(canonical_id(Service::Imdb, &json!("tt123")), Some("tt123".to_string()));
        assert_eq!(canonical_id(Service::Imdb, &json!("123")), None);
        assert_eq!(
            canonical_id(Service::AnimePlanet, &json!("cowboy-bebop")),
            Some("cowboy-bebop".to_string())
        );
        assert_eq!(canonical_id(Service::Kitsu, &json!("")), None);
    }

    #[test]
    fn test_iso_dates() {
        assert_eq!(
            parse_date(&json!("2009-04-05T00:00:00+00:00")),
            NaiveDate::from_ymd_opt(2009, 4, 5)
        );
        assert_eq!(parse_date(&json!({"year": 2001})), NaiveDate::from_ymd_opt(2001, 1, 1));
        assert_eq!(parse_date(&json!({"year": null})), None);
        // out-of-range parts are not truncated into a valid date
        assert_eq!(parse_date(&json!({"year": 2001, "month": 4294967297u64})), None);
        assert_eq!(parse_date(&json!({"year": 2001, "month": 1, "day": 4294967297u64})), None);
    }
}
