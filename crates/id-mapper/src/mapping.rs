//! The committed mapping file.
//!
//! One [`MappingRecord`] per identity group, written as a pretty JSON array in
//! a fixed field order. Numeric ids are written as numbers.

use crate::graph::{compare_native_ids, IdentityGroup, NodeKey};
use serde::{Deserialize, Deserializer, Serialize};
use shared::{MediaKind, MediaType, SeasonInfo, Service, TypeLabel};
use std::cmp::Ordering;

/// One line of the mapping file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingRecord {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, deserialize_with = "numeric_id", skip_serializing_if = "Option::is_none")]
    pub anidb_id: Option<u64>,
    #[serde(default, deserialize_with = "numeric_id", skip_serializing_if = "Option::is_none")]
    pub anilist_id: Option<u64>,
    #[serde(default, deserialize_with = "numeric_id", skip_serializing_if = "Option::is_none")]
    pub mal_id: Option<u64>,
    #[serde(default, deserialize_with = "numeric_id", skip_serializing_if = "Option::is_none")]
    pub animenewsnetwork_id: Option<u64>,
    #[serde(rename = "anime-planet_id", default, skip_serializing_if = "Option::is_none")]
    pub animeplanet_id: Option<String>,
    #[serde(default, deserialize_with = "numeric_id", skip_serializing_if = "Option::is_none")]
    pub kitsu_id: Option<u64>,
    #[serde(default, deserialize_with = "numeric_id", skip_serializing_if = "Option::is_none")]
    pub livechart_id: Option<u64>,
    #[serde(default, deserialize_with = "numeric_id", skip_serializing_if = "Option::is_none")]
    pub simkl_id: Option<u64>,
    #[serde(default, deserialize_with = "numeric_id", skip_serializing_if = "Option::is_none")]
    pub themoviedb_id: Option<u64>,
    #[serde(default, deserialize_with = "numeric_id", skip_serializing_if = "Option::is_none")]
    pub tvdb_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imdb_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<SeasonInfo>,
}

/// Accept ids written either as numbers or as digit strings
fn numeric_id<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid numeric id: {:?}", text))),
    }
}

impl MappingRecord {
    fn numeric_slot(&mut self, service: Service) -> Option<&mut Option<u64>> {
        let slot = match service {
            Service::Anidb => &mut self.anidb_id,
            Service::Anilist => &mut self.anilist_id,
            Service::Mal => &mut self.mal_id,
            Service::AnimeNewsNetwork => &mut self.animenewsnetwork_id,
            Service::Kitsu => &mut self.kitsu_id,
            Service::Livechart => &mut self.livechart_id,
            Service::Simkl => &mut self.simkl_id,
            Service::Tmdb => &mut self.themoviedb_id,
            Service::Tvdb => &mut self.tvdb_id,
            Service::AnimePlanet | Service::Imdb => return None,
        };
        Some(slot)
    }

    /// Store a canonical id; returns false if it does not fit the service
    pub fn set_id(&mut self, service: Service, native_id: &str) -> bool {
        match service {
            Service::AnimePlanet => self.animeplanet_id = Some(native_id.to_string()),
            Service::Imdb => self.imdb_id = Some(native_id.to_string()),
            numeric => {
                let (Ok(value), Some(slot)) = (native_id.parse::<u64>(), self.numeric_slot(numeric))
                else {
                    return false;
                };
                *slot = Some(value);
            }
        }
        true
    }

    pub fn id(&self, service: Service) -> Option<String> {
        let numeric = match service {
            Service::AnimePlanet => return self.animeplanet_id.clone(),
            Service::Imdb => return self.imdb_id.clone(),
            Service::Anidb => self.anidb_id,
            Service::Anilist => self.anilist_id,
            Service::Mal => self.mal_id,
            Service::AnimeNewsNetwork => self.animenewsnetwork_id,
            Service::Kitsu => self.kitsu_id,
            Service::Livechart => self.livechart_id,
            Service::Simkl => self.simkl_id,
            Service::Tmdb => self.themoviedb_id,
            Service::Tvdb => self.tvdb_id,
        };
        numeric.map(|n| n.to_string())
    }

    /// Present ids in field order
    pub fn ids(&self) -> Vec<(Service, String)> {
        Service::ALL
            .iter()
            .filter_map(|service| self.id(*service).map(|id| (*service, id)))
            .collect()
    }

    pub fn base_id(&self, kind: MediaKind) -> Option<String> {
        self.id(kind.base_service())
    }

    /// The record's type, if it names a type of `kind`
    pub fn parsed_type(&self, kind: MediaKind) -> Option<MediaType> {
        match MediaType::parse_label(self.media_type.as_deref()?) {
            TypeLabel::Known(media_type) if media_type.kind() == kind => Some(media_type),
            _ => None,
        }
    }

    fn first_key(&self) -> Option<NodeKey> {
        self.ids()
            .into_iter()
            .next()
            .map(|(service, id)| NodeKey::new(service, id))
    }
}

/// Turns identity groups into mapping records and back
#[derive(Debug, Clone)]
pub struct MappingSerializer {
    kind: MediaKind,
    emit_unanchored: bool,
}

impl MappingSerializer {
    pub fn new(kind: MediaKind, emit_unanchored: bool) -> Self {
        Self {
            kind,
            emit_unanchored,
        }
    }

    /// Record for a group, or None when the group is not emitted
    pub fn serialize_group(&self, group: &IdentityGroup) -> Option<MappingRecord> {
        if !group.observed || (!group.is_anchored() && !self.emit_unanchored) {
            return None;
        }

        let mut record = MappingRecord {
            media_type: group.media_type.map(|t| t.as_str().to_string()),
            season: group.season.filter(|s| !s.is_empty()),
            ..MappingRecord::default()
        };
        for (service, native_id) in &group.ids {
            if self.kind.includes(*service) {
                record.set_id(*service, native_id);
            }
        }

        if record.ids().is_empty() {
            return None;
        }
        Some(record)
    }

    /// Order by base id, base-less records last by their first id
    pub fn sort(&self, records: &mut [MappingRecord]) {
        let base = self.kind.base_service();
        records.sort_by(|a, b| match (a.base_id(self.kind), b.base_id(self.kind)) {
            (Some(x), Some(y)) => compare_native_ids(base, &x, &y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.first_key().cmp(&b.first_key()),
        });
    }

    /// Pretty JSON with a trailing newline
    pub fn render(&self, records: &[MappingRecord]) -> Result<String, serde_json::Error> {
        let mut content = serde_json::to_string_pretty(records)?;
        content.push('\n');
        Ok(content)
    }

    pub fn parse(&self, content: &str) -> Result<Vec<MappingRecord>, serde_json::Error> {
        serde_json::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn group(ids: &[(Service, &str)], observed: bool) -> IdentityGroup {
        let ids: BTreeMap<Service, String> = ids.iter().map(|(s, i)| (*s, i.to_string())).collect();
        let (service, id) = ids.iter().next().unwrap();
        IdentityGroup {
            representative: NodeKey::new(*service, id.clone()),
            base_id: ids.get(&Service::Anidb).cloned(),
            ids,
            media_type: Some(MediaType::Tv),
            season: None,
            observed,
        }
    }

    #[test]
    fn test_field_order_and_shapes() {
        let serializer = MappingSerializer::new(MediaKind::Anime, true);
        let mut g = group(
            &[
                (Service::Imdb, "tt0213338"),
                (Service::Anidb, "23"),
                (Service::AnimePlanet, "cowboy-bebop"),
                (Service::Mal, "1"),
            ],
            true,
        );
        g.season = Some(SeasonInfo {
            tvdb: Some(1),
            tmdb: None,
        });

        let record = serializer.serialize_group(&g).unwrap();
        let json = serializer.render(&[record]).unwrap();
        assert!(json.ends_with("]\n"));

        let expected = r#"[
  {
    "type": "TV",
    "anidb_id": 23,
    "mal_id": 1,
    "anime-planet_id": "cowboy-bebop",
    "imdb_id": "tt0213338",
    "season": {
      "tvdb": 1
    }
  }
]
"#;
        assert_eq!(json, expected);
    }

    #[test]
    fn test_field_names_match_services() {
        for service in Service::ALL {
            let id = match service {
                Service::Imdb => "tt7",
                Service::AnimePlanet => "slug",
                _ => "7",
            };
            let mut record = MappingRecord::default();
            assert!(record.set_id(service, id));

            let json = serde_json::to_value(&record).unwrap();
            let fields: Vec<&String> = json.as_object().unwrap().keys().collect();
            assert_eq!(fields, vec![service.field_name()], "{service}");
            assert_eq!(record.id(service).as_deref(), Some(id));
        }
    }

    #[test]
    fn test_unobserved_and_unanchored_groups() {
        let serializer = MappingSerializer::new(MediaKind::Anime, false);
        assert!(serializer
            .serialize_group(&group(&[(Service::Anidb, "1")], false))
            .is_none());
        assert!(serializer
            .serialize_group(&group(&[(Service::Mal, "5")], true))
            .is_none());

        let serializer = MappingSerializer::new(MediaKind::Anime, true);
        let record = serializer
            .serialize_group(&group(&[(Service::Mal, "5")], true))
            .unwrap();
        assert_eq!(record.base_id(MediaKind::Anime), None);
        assert_eq!(record.mal_id, Some(5));
    }

    #[test]
    fn test_sort_order() {
        let serializer = MappingSerializer::new(MediaKind::Anime, true);
        let mut records = Vec::new();
        for ids in [
            vec![(Service::Kitsu, "3")],
            vec![(Service::Anidb, "10")],
            vec![(Service::Mal, "7")],
            vec![(Service::Anidb, "9"), (Service::Mal, "1")],
        ] {
            let mut record = MappingRecord::default();
            for (service, id) in ids {
                assert!(record.set_id(service, id));
            }
            records.push(record);
        }

        serializer.sort(&mut records);
        let keys: Vec<_> = records.iter().map(|r| r.ids()[0].clone()).collect();
        assert_eq!(
            keys,
            vec![
                (Service::Anidb, "9".to_string()),
                (Service::Anidb, "10".to_string()),
                (Service::Mal, "7".to_string()),
                (Service::Kitsu, "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_accepts_string_ids() {
        let serializer = MappingSerializer::new(MediaKind::Manga, true);
        let records = serializer
            .parse(r#"[{"type": "MANGA", "anilist_id": "30013", "mal_id": 13, "extra": true}]"#)
            .unwrap();

        assert_eq!(records[0].anilist_id, Some(30013));
        assert_eq!(records[0].parsed_type(MediaKind::Manga), Some(MediaType::Manga));
        assert_eq!(records[0].parsed_type(MediaKind::Anime), None);
        assert_eq!(
            records[0].ids(),
            vec![(Service::Anilist, "30013".to_string()), (Service::Mal, "13".to_string())]
        );

        assert!(serializer.parse(r#"[{"mal_id": "abc"}]"#).is_err());
        assert!(serializer.parse("{}").is_err());
    }

    #[test]
    fn test_set_id_rejects_non_numeric() {
        let mut record = MappingRecord::default();
        assert!(!record.set_id(Service::Tvdb, "movie"));
        assert!(record.set_id(Service::Imdb, "tt1"));
        assert_eq!(record.id(Service::Imdb).as_deref(), Some("tt1"));
        assert_eq!(record.tvdb_id, None);
    }
}
