//! Links to third-party download sites for a requested video.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::identifier::Identifier;

const OEMBED_ENDPOINT: &str = "https://www.youtube.com/oembed";

struct LinkService {
    name: &'static str,
    template: &'static str,
    youtube_only: bool,
}

const SERVICES: [LinkService; 5] = [
    LinkService {
        name: "SaveFrom",
        template: "https://en.savefrom.net/#url={url}",
        youtube_only: false,
    },
    LinkService {
        name: "Y2Mate",
        template: "https://www.y2mate.com/youtube/{id}",
        youtube_only: true,
    },
    LinkService {
        name: "SSYouTube",
        template: "https://ssyoutube.com/watch?v={id}",
        youtube_only: true,
    },
    LinkService {
        name: "Cobalt",
        template: "https://cobalt.tools/#{url}",
        youtube_only: false,
    },
    LinkService {
        name: "Loader.to",
        template: "https://loader.to/api/button/?url={url}&f=mp4",
        youtube_only: false,
    },
];

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct DownloadLink {
    pub name: &'static str,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct OEmbedResponse {
    title: Option<String>,
}

pub fn build_links(url: &Url, identifier: &Identifier) -> Vec<DownloadLink> {
    let encoded_url = urlencoding::encode(url.as_str());

    SERVICES
        .iter()
        .filter_map(|service| {
            let id = identifier.youtube_id();
            if service.youtube_only && id.is_none() {
                return None;
            }
            let link = service
                .template
                .replace("{url}", &encoded_url)
                .replace("{id}", id.unwrap_or_default());
            Some(DownloadLink {
                name: service.name,
                url: link,
            })
        })
        .collect()
}

/// Best-effort title lookup through YouTube's oEmbed endpoint.
pub async fn resolve_title(client: &reqwest::Client, identifier: &Identifier) -> Option<String> {
    let id = identifier.youtube_id()?;
    let watch_url = format!("https://www.youtube.com/watch?v={id}");

    let response = match client
        .get(OEMBED_ENDPOINT)
        .query(&[("url", watch_url.as_str()), ("format", "json")])
        .send()
        .await
    {
        Ok(response) => response,
        Err(error) => {
            warn!("oEmbed lookup failed for {id}: {error}");
            return None;
        }
    };

    if !response.status().is_success() {
        debug!("oEmbed returned {} for {id}", response.status());
        return None;
    }

    match response.json::<OEmbedResponse>().await {
        Ok(body) => body.title.filter(|title| !title.trim().is_empty()),
        Err(error) => {
            warn!("unreadable oEmbed response for {id}: {error}");
            None
        }
    }
}
