//! Typed catalog records and the per-entity dispatch table
//!
//! The parser hands each top-level dump element over as an [`Element`] tree;
//! [`EntitySpec::build`] turns it into a [`CatalogRecord`]. Which XML tag opens
//! a record, how it is built and which table it lands in is looked up in
//! [`ENTITY_SPECS`], so the pipeline itself never matches on entity type.

use serde::Serialize;
use thiserror::Error;
use waxlog_common::types::EntityType;

/// A record element could not be turned into a catalog row
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("<{0}> has no id")]
    MissingId(&'static str),

    #[error("<{tag}> has non-numeric id '{value}'")]
    InvalidId { tag: &'static str, value: String },
}

/// Minimal owned XML element tree for a single record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Trimmed text, `None` when blank
    pub fn value(&self) -> Option<String> {
        let text = self.text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    pub fn child_text(&self, name: &str) -> Option<String> {
        self.child(name).and_then(Element::value)
    }

    /// Texts of `<list><item>..</item>..</list>`
    pub fn list(&self, list: &str, item: &str) -> Vec<String> {
        self.child(list)
            .map(|l| l.children_named(item).filter_map(Element::value).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
}

impl NamedRef {
    /// `<name id="..">text</name>` style reference
    fn from_attr(el: &Element) -> Option<Self> {
        Some(Self {
            id: el.attr("id").and_then(|v| v.trim().parse().ok()),
            name: el.value()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtistCredit {
    pub id: Option<i64>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl ArtistCredit {
    fn from_element(el: &Element) -> Option<Self> {
        Some(Self {
            id: el.child_text("id").and_then(|v| v.parse().ok()),
            name: el.child_text("name")?,
            anv: el.child_text("anv"),
            join: el.child_text("join"),
            role: el.child_text("role"),
        })
    }

    fn list(parent: &Element, list: &str) -> Vec<Self> {
        parent
            .child(list)
            .map(|l| l.children_named("artist").filter_map(Self::from_element).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtistRecord {
    pub id: i64,
    pub name: String,
    pub real_name: Option<String>,
    pub profile: Option<String>,
    pub data_quality: Option<String>,
    pub urls: Vec<String>,
    pub name_variations: Vec<String>,
    pub aliases: Vec<NamedRef>,
    pub members: Vec<NamedRef>,
    pub groups: Vec<NamedRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelRecord {
    pub id: i64,
    pub name: String,
    pub contact_info: Option<String>,
    pub profile: Option<String>,
    pub data_quality: Option<String>,
    pub parent_label: Option<NamedRef>,
    pub sublabels: Vec<NamedRef>,
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MasterRecord {
    pub id: i64,
    pub title: String,
    pub main_release: Option<i64>,
    pub year: Option<i32>,
    pub data_quality: Option<String>,
    pub artists: Vec<ArtistCredit>,
    pub genres: Vec<String>,
    pub styles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseLabel {
    pub id: Option<i64>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catno: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseFormat {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub descriptions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Track {
    pub position: Option<String>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseRecord {
    pub id: i64,
    pub title: String,
    pub status: Option<String>,
    pub country: Option<String>,
    pub released: Option<String>,
    pub master_id: Option<i64>,
    pub data_quality: Option<String>,
    pub artists: Vec<ArtistCredit>,
    pub extra_artists: Vec<ArtistCredit>,
    pub labels: Vec<ReleaseLabel>,
    pub formats: Vec<ReleaseFormat>,
    pub genres: Vec<String>,
    pub styles: Vec<String>,
    pub tracklist: Vec<Track>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CatalogRecord {
    Artist(ArtistRecord),
    Label(LabelRecord),
    Master(MasterRecord),
    Release(ReleaseRecord),
}

impl CatalogRecord {
    pub fn id(&self) -> i64 {
        match self {
            CatalogRecord::Artist(r) => r.id,
            CatalogRecord::Label(r) => r.id,
            CatalogRecord::Master(r) => r.id,
            CatalogRecord::Release(r) => r.id,
        }
    }

    pub fn entity(&self) -> EntityType {
        match self {
            CatalogRecord::Artist(_) => EntityType::Artists,
            CatalogRecord::Label(_) => EntityType::Labels,
            CatalogRecord::Master(_) => EntityType::Masters,
            CatalogRecord::Release(_) => EntityType::Releases,
        }
    }
}

type BuildFn = fn(&Element) -> Result<CatalogRecord, RecordError>;

/// How one entity type is read and where it is written
#[derive(Debug)]
pub struct EntitySpec {
    pub entity: EntityType,
    /// Tag of a top-level record inside the dump's root element
    pub record_tag: &'static str,
    pub table: &'static str,
    build: BuildFn,
}

impl EntitySpec {
    pub fn build(&self, element: &Element) -> Result<CatalogRecord, RecordError> {
        (self.build)(element)
    }
}

pub static ENTITY_SPECS: [EntitySpec; 4] = [
    EntitySpec {
        entity: EntityType::Artists,
        record_tag: "artist",
        table: "artists",
        build: build_artist,
    },
    EntitySpec {
        entity: EntityType::Labels,
        record_tag: "label",
        table: "labels",
        build: build_label,
    },
    EntitySpec {
        entity: EntityType::Masters,
        record_tag: "master",
        table: "masters",
        build: build_master,
    },
    EntitySpec {
        entity: EntityType::Releases,
        record_tag: "release",
        table: "releases",
        build: build_release,
    },
];

pub fn spec_for(entity: EntityType) -> &'static EntitySpec {
    match entity {
        EntityType::Artists => &ENTITY_SPECS[0],
        EntityType::Labels => &ENTITY_SPECS[1],
        EntityType::Masters => &ENTITY_SPECS[2],
        EntityType::Releases => &ENTITY_SPECS[3],
    }
}

/// Artists and labels carry `<id>` children; masters and releases an `id` attribute
fn record_id(el: &Element, tag: &'static str) -> Result<i64, RecordError> {
    let raw = el
        .child_text("id")
        .or_else(|| el.attr("id").map(str::to_string))
        .ok_or(RecordError::MissingId(tag))?;
    raw.trim().parse().map_err(|_| RecordError::InvalidId { tag, value: raw })
}

fn refs(parent: &Element, list: &str, item: &str) -> Vec<NamedRef> {
    parent
        .child(list)
        .map(|l| l.children_named(item).filter_map(NamedRef::from_attr).collect())
        .unwrap_or_default()
}

fn build_artist(el: &Element) -> Result<CatalogRecord, RecordError> {
    let id = record_id(el, "artist")?;
    Ok(CatalogRecord::Artist(ArtistRecord {
        id,
        name: el.child_text("name").unwrap_or_default(),
        real_name: el.child_text("realname"),
        profile: el.child_text("profile"),
        data_quality: el.child_text("data_quality"),
        urls: el.list("urls", "url"),
        name_variations: el.list("namevariations", "name"),
        aliases: refs(el, "aliases", "name"),
        members: refs(el, "members", "name"),
        groups: refs(el, "groups", "name"),
    }))
}

fn build_label(el: &Element) -> Result<CatalogRecord, RecordError> {
    let id = record_id(el, "label")?;
    Ok(CatalogRecord::Label(LabelRecord {
        id,
        name: el.child_text("name").unwrap_or_default(),
        contact_info: el.child_text("contactinfo"),
        profile: el.child_text("profile"),
        data_quality: el.child_text("data_quality"),
        parent_label: el.child("parentLabel").and_then(NamedRef::from_attr),
        sublabels: refs(el, "sublabels", "label"),
        urls: el.list("urls", "url"),
    }))
}

fn build_master(el: &Element) -> Result<CatalogRecord, RecordError> {
    let id = record_id(el, "master")?;
    Ok(CatalogRecord::Master(MasterRecord {
        id,
        title: el.child_text("title").unwrap_or_default(),
        main_release: el.child_text("main_release").and_then(|v| v.parse().ok()),
        year: el
            .child_text("year")
            .and_then(|v| v.parse().ok())
            .filter(|y| *y > 0),
        data_quality: el.child_text("data_quality"),
        artists: ArtistCredit::list(el, "artists"),
        genres: el.list("genres", "genre"),
        styles: el.list("styles", "style"),
    }))
}

fn build_release(el: &Element) -> Result<CatalogRecord, RecordError> {
    let id = record_id(el, "release")?;

    let labels = el
        .child("labels")
        .map(|l| {
            l.children_named("label")
                .filter_map(|label| {
                    Some(ReleaseLabel {
                        id: label.attr("id").and_then(|v| v.parse().ok()),
                        name: label.attr("name")?.to_string(),
                        catno: label.attr("catno").map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let formats = el
        .child("formats")
        .map(|f| {
            f.children_named("format")
                .filter_map(|format| {
                    Some(ReleaseFormat {
                        name: format.attr("name")?.to_string(),
                        qty: format.attr("qty").map(str::to_string),
                        text: format.attr("text").filter(|t| !t.is_empty()).map(str::to_string),
                        descriptions: format.list("descriptions", "description"),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let tracklist = el
        .child("tracklist")
        .map(|t| {
            t.children_named("track")
                .filter_map(|track| {
                    Some(Track {
                        position: track.child_text("position"),
                        title: track.child_text("title")?,
                        duration: track.child_text("duration"),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(CatalogRecord::Release(ReleaseRecord {
        id,
        title: el.child_text("title").unwrap_or_default(),
        status: el.attr("status").map(str::to_string),
        country: el.child_text("country"),
        released: el.child_text("released"),
        master_id: el.child_text("master_id").and_then(|v| v.parse().ok()),
        data_quality: el.child_text("data_quality"),
        artists: ArtistCredit::list(el, "artists"),
        extra_artists: ArtistCredit::list(el, "extraartists"),
        labels,
        formats,
        genres: el.list("genres", "genre"),
        styles: el.list("styles", "style"),
        tracklist,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(name: &str, value: &str) -> Element {
        Element {
            text: value.to_string(),
            ..Element::new(name)
        }
    }

    fn with_children(name: &str, children: Vec<Element>) -> Element {
        Element {
            children,
            ..Element::new(name)
        }
    }

    #[test]
    fn test_spec_table_covers_every_entity() {
        for entity in EntityType::ALL {
            assert_eq!(spec_for(entity).entity, entity);
            assert_eq!(spec_for(entity).table, entity.as_str());
        }
    }

    #[test]
    fn test_build_artist_from_children() {
        let el = with_children(
            "artist",
            vec![
                text("id", " 42 "),
                text("name", "Stereolab"),
                with_children("members", vec![Element {
                    attrs: vec![("id".into(), "7".into())],
                    ..text("name", "Laetitia Sadier")
                }]),
            ],
        );

        let CatalogRecord::Artist(artist) = spec_for(EntityType::Artists).build(&el).unwrap() else {
            panic!("expected artist");
        };
        assert_eq!(artist.id, 42);
        assert_eq!(artist.name, "Stereolab");
        assert_eq!(
            artist.members,
            vec![NamedRef {
                id: Some(7),
                name: "Laetitia Sadier".into()
            }]
        );
    }

    #[test]
    fn test_build_release_reads_attribute_id() {
        let el = Element {
            attrs: vec![("id".into(), "9".into()), ("status".into(), "Accepted".into())],
            children: vec![text("title", "Dots And Loops"), text("master_id", "1234")],
            ..Element::new("release")
        };

        let record = spec_for(EntityType::Releases).build(&el).unwrap();
        assert_eq!(record.id(), 9);
        let CatalogRecord::Release(release) = record else {
            panic!("expected release");
        };
        assert_eq!(release.status.as_deref(), Some("Accepted"));
        assert_eq!(release.master_id, Some(1234));
    }

    #[test]
    fn test_missing_and_invalid_ids() {
        let missing = Element::new("label");
        assert_eq!(
            spec_for(EntityType::Labels).build(&missing).unwrap_err(),
            RecordError::MissingId("label")
        );

        let invalid = Element {
            attrs: vec![("id".into(), "abc".into())],
            ..Element::new("master")
        };
        assert!(matches!(
            spec_for(EntityType::Masters).build(&invalid),
            Err(RecordError::InvalidId { tag: "master", .. })
        ));
    }
}
