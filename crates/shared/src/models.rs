//! Data models for the project.
//!
//! This module defines the vocabulary shared by every crate in the workspace:
//! the supported services, the media kinds a mapping pass runs over, the
//! normalized media types and the season offsets carried into the output.

use serde::{Deserialize, Serialize};

/// An external anime/manga database that publishes its own ids
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Service {
    #[serde(rename = "anidb")]
    Anidb,
    #[serde(rename = "anilist")]
    Anilist,
    #[serde(rename = "mal")]
    Mal,
    #[serde(rename = "animenewsnetwork")]
    AnimeNewsNetwork,
    #[serde(rename = "animeplanet")]
    AnimePlanet,
    #[serde(rename = "kitsu")]
    Kitsu,
    #[serde(rename = "livechart")]
    Livechart,
    #[serde(rename = "simkl")]
    Simkl,
    #[serde(rename = "themoviedb")]
    Tmdb,
    #[serde(rename = "tvdb")]
    Tvdb,
    #[serde(rename = "imdb")]
    Imdb,
}

impl Service {
    /// Every service, in output field order
    pub const ALL: [Service; 11] = [
        Service::Anidb,
        Service::Anilist,
        Service::Mal,
        Service::AnimeNewsNetwork,
        Service::AnimePlanet,
        Service::Kitsu,
        Service::Livechart,
        Service::Simkl,
        Service::Tmdb,
        Service::Tvdb,
        Service::Imdb,
    ];

    /// Canonical tag used in checkpoints, logs and node keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Anidb => "anidb",
            Service::Anilist => "anilist",
            Service::Mal => "mal",
            Service::AnimeNewsNetwork => "animenewsnetwork",
            Service::AnimePlanet => "animeplanet",
            Service::Kitsu => "kitsu",
            Service::Livechart => "livechart",
            Service::Simkl => "simkl",
            Service::Tmdb => "themoviedb",
            Service::Tvdb => "tvdb",
            Service::Imdb => "imdb",
        }
    }

    /// Name used by the scrapers for their output files
    /// (`<file_tag>-<kind>.json`)
    pub fn file_tag(&self) -> &'static str {
        match self {
            Service::Mal => "myanimelist",
            other => other.as_str(),
        }
    }

    /// Field name in the committed mapping file
    pub fn field_name(&self) -> &'static str {
        match self {
            Service::Anidb => "anidb_id",
            Service::Anilist => "anilist_id",
            Service::Mal => "mal_id",
            Service::AnimeNewsNetwork => "animenewsnetwork_id",
            Service::AnimePlanet => "anime-planet_id",
            Service::Kitsu => "kitsu_id",
            Service::Livechart => "livechart_id",
            Service::Simkl => "simkl_id",
            Service::Tmdb => "themoviedb_id",
            Service::Tvdb => "tvdb_id",
            Service::Imdb => "imdb_id",
        }
    }

    /// Whether ids of this service are plain non-negative integers.
    ///
    /// Anime-Planet uses slugs and IMDb uses `tt`-prefixed ids.
    pub fn has_numeric_ids(&self) -> bool {
        !matches!(self, Service::AnimePlanet | Service::Imdb)
    }

    /// Resolve a service name as it appears in scraper payloads.
    ///
    /// Accepts the canonical tags plus the aliases the scrapers use
    /// (`myanimelist`, `tmdb`, `thetvdb`, `anime-planet`, `ann`).
    pub fn from_alias(name: &str) -> Option<Self> {
        let service = match name.trim().to_ascii_lowercase().as_str() {
            "anidb" => Service::Anidb,
            "anilist" => Service::Anilist,
            "mal" | "myanimelist" => Service::Mal,
            "animenewsnetwork" | "ann" => Service::AnimeNewsNetwork,
            "animeplanet" | "anime-planet" => Service::AnimePlanet,
            "kitsu" => Service::Kitsu,
            "livechart" => Service::Livechart,
            "simkl" => Service::Simkl,
            "themoviedb" | "tmdb" => Service::Tmdb,
            "tvdb" | "thetvdb" => Service::Tvdb,
            "imdb" => Service::Imdb,
            _ => return None,
        };
        Some(service)
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Service {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Service::from_alias(s).ok_or_else(|| anyhow::anyhow!("Unknown service: {}", s))
    }
}

/// Which catalogue a mapping pass covers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Anime,
    Manga,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Anime => "anime",
            MediaKind::Manga => "manga",
        }
    }

    /// The service whose id anchors every group of this kind
    pub fn base_service(&self) -> Service {
        match self {
            MediaKind::Anime => Service::Anidb,
            MediaKind::Manga => Service::Anilist,
        }
    }

    /// Services taking part in a pass of this kind, in ingestion order
    pub fn services(&self) -> &'static [Service] {
        match self {
            MediaKind::Anime => &Service::ALL,
            MediaKind::Manga => &[Service::Anilist, Service::Mal, Service::Kitsu],
        }
    }

    pub fn includes(&self, service: Service) -> bool {
        self.services().contains(&service)
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MediaKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anime" => Ok(MediaKind::Anime),
            "manga" => Ok(MediaKind::Manga),
            _ => Err(anyhow::anyhow!("Invalid media kind: {}", s)),
        }
    }
}

/// Normalized media type, using AniList's format vocabulary
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaType {
    Tv,
    TvShort,
    Movie,
    Ova,
    Ona,
    Special,
    Music,
    Manga,
    Novel,
    OneShot,
    Manhwa,
    Manhua,
    Doujinshi,
}

/// Result of reading a raw type label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeLabel {
    /// Label was empty or a known placeholder
    Absent,
    Known(MediaType),
    /// Label names a format of this kind that has no [`MediaType`] of its own,
    /// such as `CM` or `OEL`
    Untyped(MediaKind),
    /// Label is not in the vocabulary
    Unrecognized,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Tv => "TV",
            MediaType::TvShort => "TV_SHORT",
            MediaType::Movie => "MOVIE",
            MediaType::Ova => "OVA",
            MediaType::Ona => "ONA",
            MediaType::Special => "SPECIAL",
            MediaType::Music => "MUSIC",
            MediaType::Manga => "MANGA",
            MediaType::Novel => "NOVEL",
            MediaType::OneShot => "ONE_SHOT",
            MediaType::Manhwa => "MANHWA",
            MediaType::Manhua => "MANHUA",
            MediaType::Doujinshi => "DOUJINSHI",
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            MediaType::Tv
            | MediaType::TvShort
            | MediaType::Movie
            | MediaType::Ova
            | MediaType::Ona
            | MediaType::Special
            | MediaType::Music => MediaKind::Anime,
            MediaType::Manga
            | MediaType::Novel
            | MediaType::OneShot
            | MediaType::Manhwa
            | MediaType::Manhua
            | MediaType::Doujinshi => MediaKind::Manga,
        }
    }

    /// Parse a type label as written by any of the services.
    ///
    /// Matching ignores case and punctuation, so `TV_SHORT`, `Light Novel`
    /// and `One-shot` all resolve.
    pub fn parse_label(label: &str) -> TypeLabel {
        let squashed: String = label
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        let media_type = match squashed.as_str() {
            "" | "UNKNOWN" => return TypeLabel::Absent,
            "TV" | "TVSERIES" | "TVMINISERIES" => MediaType::Tv,
            "TVSHORT" => MediaType::TvShort,
            "MOVIE" | "TVMOVIE" => MediaType::Movie,
            "OVA" | "OAV" | "VIDEO" => MediaType::Ova,
            "ONA" | "WEB" => MediaType::Ona,
            "SPECIAL" | "TVSPECIAL" | "DVDSPECIAL" => MediaType::Special,
            "MUSIC" | "MUSICVIDEO" => MediaType::Music,
            "MANGA" => MediaType::Manga,
            "NOVEL" | "LIGHTNOVEL" => MediaType::Novel,
            "ONESHOT" => MediaType::OneShot,
            "MANHWA" => MediaType::Manhwa,
            "MANHUA" => MediaType::Manhua,
            "DOUJIN" | "DOUJINSHI" => MediaType::Doujinshi,
            "CM" | "PV" | "OTHER" | "SHORT" | "TVEPISODE" => {
                return TypeLabel::Untyped(MediaKind::Anime)
            }
            "OEL" => return TypeLabel::Untyped(MediaKind::Manga),
            _ => return TypeLabel::Unrecognized,
        };
        TypeLabel::Known(media_type)
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Season offsets on TVDB/TMDB, as published by the AniDB anime-lists
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeasonInfo {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tvdb: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tmdb: Option<u32>,
}

impl SeasonInfo {
    pub fn is_empty(&self) -> bool {
        self.tvdb.is_none() && self.tmdb.is_none()
    }

    /// Fill slots that are still empty from `other`
    pub fn merge_missing(&mut self, other: &SeasonInfo) {
        if self.tvdb.is_none() {
            self.tvdb = other.tvdb;
        }
        if self.tmdb.is_none() {
            self.tmdb = other.tmdb;
        }
    }
}
