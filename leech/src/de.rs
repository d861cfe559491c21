use serde::{de, Deserialize};
use url::Url;

// Deserialiser functions for metainfo.

pub fn opt_url_deserialize<'de, D>(deserializer: D) -> Result<Option<Url>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Url::parse(&s).map(Some).map_err(de::Error::custom)
}

// Unparseable urls are dropped rather than failing the whole torrent,
// empty tiers are removed.
pub fn announce_list_deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<Vec<Url>>>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let raw = Vec::<Vec<String>>::deserialize(deserializer)?;
    let announce_list: Vec<Vec<Url>> = raw
        .into_iter()
        .map(|tier| {
            tier.iter()
                .filter_map(|url| Url::parse(url).ok())
                .collect::<Vec<_>>()
        })
        .filter(|tier| !tier.is_empty())
        .collect();

    if announce_list.is_empty() { Ok(None) } else { Ok(Some(announce_list)) }
}
