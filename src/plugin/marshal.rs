//! Lifting script results into domain types
//!
//! Field lookups accept both camelCase and snake_case spellings and coerce
//! leniently through [`ScriptValue`]. Required fields are strict: a manga
//! without key or title, a chapter without key or a page without url/text
//! fails the whole result with a `ParseError`.

use super::types::{
    Chapter, Command, CommandKind, FilterDefinition, Listing, Manga, MangaStatus, Page, PageResult,
    SortSelection, TriState,
};
use super::value::ScriptValue;
use crate::core::error::{Result, TingError};
use crate::network::HttpRequest;
use std::collections::HashMap;
use url::Url;

fn lookup<'a>(value: &'a ScriptValue, names: &[&str]) -> Option<&'a ScriptValue> {
    names.iter().find_map(|name| value.field(name))
}

fn text(value: &ScriptValue, names: &[&str]) -> Option<String> {
    lookup(value, names).and_then(ScriptValue::as_non_empty_string)
}

fn required(value: &ScriptValue, names: &[&str], what: &str) -> Result<String> {
    text(value, names).ok_or_else(|| TingError::ParseError(format!("{} is missing '{}'", what, names[0])))
}

fn string_list(value: Option<&ScriptValue>) -> Vec<String> {
    value
        .and_then(ScriptValue::as_list)
        .unwrap_or_default()
        .iter()
        .filter_map(ScriptValue::as_non_empty_string)
        .collect()
}

fn items(value: &ScriptValue, what: &str) -> Result<Vec<ScriptValue>> {
    match value {
        ScriptValue::Null => Ok(Vec::new()),
        ScriptValue::List(items) => Ok(items.clone()),
        other => Err(TingError::ParseError(format!(
            "Expected a list of {}, got {}",
            what,
            other.type_name()
        ))),
    }
}

fn status(value: Option<&ScriptValue>) -> MangaStatus {
    match value {
        Some(ScriptValue::String(label)) => match label.trim().parse::<i64>() {
            Ok(code) => MangaStatus::from_code(code),
            Err(_) => MangaStatus::from_label(label),
        },
        Some(other) => other.as_int().map(MangaStatus::from_code).unwrap_or_default(),
        None => MangaStatus::Unknown,
    }
}

pub fn manga(value: &ScriptValue) -> Result<Manga> {
    if value.as_map().is_none() {
        return Err(TingError::ParseError(format!(
            "Expected a manga object, got {}",
            value.type_name()
        )));
    }

    Ok(Manga {
        key: required(value, &["key", "url"], "Manga")?,
        title: required(value, &["title", "name"], "Manga")?,
        author: text(value, &["author"]),
        artist: text(value, &["artist"]),
        description: text(value, &["description"]),
        cover: text(value, &["cover", "thumbnailUrl", "thumbnail_url"]),
        genres: string_list(lookup(value, &["genres", "genre"])),
        status: status(lookup(value, &["status"])),
    })
}

/// Details returned for a known manga; missing fields keep their old value
pub fn manga_details(value: &ScriptValue, previous: &Manga) -> Result<Manga> {
    if value.as_map().is_none() {
        return Err(TingError::ParseError(format!(
            "Expected a manga object, got {}",
            value.type_name()
        )));
    }

    let genres = string_list(lookup(value, &["genres", "genre"]));
    let status = match lookup(value, &["status"]) {
        Some(raw) => status(Some(raw)),
        None => previous.status,
    };

    let title = text(value, &["title", "name"]).unwrap_or_else(|| previous.title.clone());
    if title.is_empty() {
        return Err(TingError::ParseError("Manga is missing 'title'".to_string()));
    }

    Ok(Manga {
        key: text(value, &["key", "url"]).unwrap_or_else(|| previous.key.clone()),
        title,
        author: text(value, &["author"]).or_else(|| previous.author.clone()),
        artist: text(value, &["artist"]).or_else(|| previous.artist.clone()),
        description: text(value, &["description"]).or_else(|| previous.description.clone()),
        cover: text(value, &["cover", "thumbnailUrl", "thumbnail_url"])
            .or_else(|| previous.cover.clone()),
        genres: if genres.is_empty() { previous.genres.clone() } else { genres },
        status,
    })
}

/// Accepts `{mangas, hasNextPage}` or a bare list of mangas
pub fn page_result(value: &ScriptValue) -> Result<PageResult> {
    let (list, has_next_page) = match value {
        ScriptValue::Object(_) => (
            lookup(value, &["mangas", "manga", "items"]).cloned().unwrap_or_default(),
            lookup(value, &["hasNextPage", "has_next_page", "hasNext"])
                .and_then(ScriptValue::as_boolean)
                .unwrap_or(false),
        ),
        other => (other.clone(), false),
    };

    let mangas = items(&list, "mangas")?
        .iter()
        .map(manga)
        .collect::<Result<Vec<_>>>()?;

    Ok(PageResult { mangas, has_next_page })
}

pub fn chapter(value: &ScriptValue) -> Result<Chapter> {
    if value.as_map().is_none() {
        return Err(TingError::ParseError(format!(
            "Expected a chapter object, got {}",
            value.type_name()
        )));
    }

    let key = required(value, &["key", "url"], "Chapter")?;
    Ok(Chapter {
        name: text(value, &["name", "title"]).unwrap_or_else(|| key.clone()),
        number: lookup(value, &["number", "chapterNumber", "chapter_number"])
            .and_then(ScriptValue::as_float)
            .map(|n| n as f32)
            .unwrap_or(-1.0),
        date_upload: lookup(value, &["dateUpload", "date_upload"])
            .and_then(ScriptValue::as_int)
            .unwrap_or(0),
        scanlator: text(value, &["scanlator"]),
        key,
    })
}

pub fn chapters(value: &ScriptValue) -> Result<Vec<Chapter>> {
    items(value, "chapters")?.iter().map(chapter).collect()
}

/// A bare string is an image URL
pub fn page(value: &ScriptValue) -> Result<Page> {
    if let ScriptValue::String(url) = value {
        let url = url.trim();
        if url.is_empty() {
            return Err(TingError::ParseError("Page has an empty url".to_string()));
        }
        return Ok(Page::Image {
            url: url.to_string(),
            referer: None,
        });
    }

    if let Some(text) = text(value, &["text", "content"]) {
        return Ok(Page::Text { text });
    }

    match text(value, &["url", "imageUrl", "image_url"]) {
        Some(url) => Ok(Page::Image {
            url,
            referer: text(value, &["referer"]),
        }),
        None => Err(TingError::ParseError("Page is missing 'url' or 'text'".to_string())),
    }
}

pub fn pages(value: &ScriptValue) -> Result<Vec<Page>> {
    items(value, "pages")?.iter().map(page).collect()
}

pub fn listings(value: &ScriptValue) -> Result<Vec<Listing>> {
    items(value, "listings")?
        .iter()
        .map(|item| {
            item.as_non_empty_string()
                .or_else(|| text(item, &["name"]))
                .map(Listing::new)
                .ok_or_else(|| TingError::ParseError("Listing is missing 'name'".to_string()))
        })
        .collect()
}

pub fn filter(value: &ScriptValue) -> Result<FilterDefinition> {
    let name = required(value, &["name"], "Filter")?;
    let key = text(value, &["key", "id"]).unwrap_or_else(|| name.clone());
    let kind = text(value, &["type", "kind"]).unwrap_or_default().to_ascii_lowercase();
    let default = lookup(value, &["default", "value", "state"]);

    let definition = match kind.as_str() {
        "title" | "header" | "note" => FilterDefinition::Title { name },
        "text" | "search" => FilterDefinition::Text {
            key,
            name,
            default: default.and_then(ScriptValue::as_string).unwrap_or_default(),
        },
        "select" => FilterDefinition::Select {
            key,
            name,
            options: string_list(lookup(value, &["options", "values"])),
            default: default
                .and_then(ScriptValue::as_int)
                .map(|i| i.max(0) as usize)
                .unwrap_or(0),
        },
        "check" | "checkbox" => FilterDefinition::Check {
            key,
            name,
            default: default.and_then(ScriptValue::as_boolean),
        },
        "tristate" | "tri_state" | "genre" => FilterDefinition::TriState {
            key,
            name,
            default: match default.and_then(ScriptValue::as_int) {
                Some(1) => TriState::Included,
                Some(2) => TriState::Excluded,
                _ => TriState::Ignored,
            },
        },
        "group" => FilterDefinition::Group {
            name,
            filters: items(lookup(value, &["filters"]).unwrap_or(&ScriptValue::Null), "filters")?
                .iter()
                .map(filter)
                .collect::<Result<Vec<_>>>()?,
        },
        "sort" => FilterDefinition::Sort {
            key,
            name,
            options: string_list(lookup(value, &["options", "values"])),
            default: default.and_then(|d| {
                Some(SortSelection {
                    index: lookup(d, &["index"])?.as_int()?.max(0) as usize,
                    ascending: lookup(d, &["ascending"])
                        .and_then(ScriptValue::as_boolean)
                        .unwrap_or(false),
                })
            }),
        },
        other => {
            return Err(TingError::ParseError(format!(
                "Filter '{}' has unknown type '{}'",
                name, other
            )))
        }
    };

    Ok(definition)
}

pub fn filters(value: &ScriptValue) -> Result<Vec<FilterDefinition>> {
    items(value, "filters")?.iter().map(filter).collect()
}

pub fn command(value: &ScriptValue) -> Result<Command> {
    let name = required(value, &["name"], "Command")?;
    let kind = match text(value, &["type", "kind"])
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "note" => CommandKind::Note,
        "text" => CommandKind::Text {
            value: text(value, &["value"]).unwrap_or_default(),
            hint: text(value, &["hint"]).unwrap_or_default(),
        },
        "select" => CommandKind::Select {
            options: string_list(lookup(value, &["options"])),
            value: lookup(value, &["value"])
                .and_then(ScriptValue::as_int)
                .map(|i| i.max(0) as usize)
                .unwrap_or(0),
        },
        "fetchers" | "fetcher" => CommandKind::Fetchers {
            url: text(value, &["url"]).unwrap_or_default(),
            html: text(value, &["html"]).unwrap_or_default(),
        },
        other => {
            return Err(TingError::ParseError(format!(
                "Command '{}' has unknown type '{}'",
                name, other
            )))
        }
    };

    Ok(Command { name, kind })
}

pub fn commands(value: &ScriptValue) -> Result<Vec<Command>> {
    items(value, "commands")?.iter().map(command).collect()
}

/// Request described by a `*Request` function, resolved against `base_url`
///
/// A bare string is a GET of that URL.
pub fn request(value: &ScriptValue, base_url: &str) -> Result<HttpRequest> {
    let (raw_url, method, headers, body) = match value {
        ScriptValue::String(url) => (url.clone(), None, HashMap::new(), None),
        ScriptValue::Object(_) => (
            required(value, &["url"], "Request")?,
            text(value, &["method"]),
            value
                .field("headers")
                .and_then(ScriptValue::as_map)
                .map(|map| {
                    map.iter()
                        .filter_map(|(k, v)| v.as_string().map(|v| (k.clone(), v)))
                        .collect()
                })
                .unwrap_or_default(),
            value.field("body").and_then(|b| match b {
                ScriptValue::Object(_) | ScriptValue::List(_) => Some(b.to_json().to_string()),
                other => other.as_string(),
            }),
        ),
        other => {
            return Err(TingError::ParseError(format!(
                "Expected a request object, got {}",
                other.type_name()
            )))
        }
    };

    Ok(HttpRequest {
        method: method.unwrap_or_else(|| "GET".to_string()).to_ascii_uppercase(),
        url: resolve_url(base_url, &raw_url)?,
        headers,
        body,
    })
}

/// Resolve a possibly relative URL or key against a source's base URL
pub fn resolve_url(base_url: &str, target: &str) -> Result<String> {
    let base = Url::parse(base_url)
        .map_err(|e| TingError::ParseError(format!("Invalid base URL {}: {}", base_url, e)))?;
    base.join(target.trim())
        .map(|u| u.to_string())
        .map_err(|e| TingError::ParseError(format!("Invalid URL {}: {}", target, e)))
}
