use std::path::Path;

use segdl_engine::Stream;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::error::{AppError, Result};

#[derive(Deserialize)]
#[serde(untagged)]
enum Manifest {
    Many(Vec<Stream>),
    One(Stream),
}

/// Load the streams to download from a JSON manifest file.
pub async fn load_streams(path: &Path) -> Result<Vec<Stream>> {
    debug!(path = %path.display(), "Reading manifest");
    let raw = tokio::fs::read(path).await?;
    let streams = parse_manifest(&raw)?;
    info!(
        streams = streams.len(),
        segments = streams.iter().map(|s| s.segments.len()).sum::<usize>(),
        "Manifest loaded"
    );
    Ok(streams)
}

pub fn parse_manifest(raw: &[u8]) -> Result<Vec<Stream>> {
    let streams = match serde_json::from_slice::<Manifest>(raw)? {
        Manifest::Many(streams) => streams,
        Manifest::One(stream) => vec![stream],
    };
    if streams.is_empty() {
        error!("Manifest lists no streams");
        return Err(AppError::InvalidInput("manifest lists no streams".into()));
    }
    for stream in &streams {
        if let Some(id) = stream.duplicate_id() {
            return Err(AppError::InvalidInput(format!(
                "stream `{}` lists segment {id} more than once",
                stream.name
            )));
        }
    }
    Ok(streams)
}

/// Parses `key=value` strings, splitting at the first '='.
pub fn parse_params(params: &[String]) -> Result<Vec<(String, String)>> {
    params
        .iter()
        .map(|param| {
            param
                .split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| AppError::InvalidInput(format!("Invalid param format: {param}")))
        })
        .collect()
}

/// Parses `Name: value` header strings.
pub fn parse_headers(headers: &[String]) -> Result<Vec<(String, String)>> {
    headers
        .iter()
        .map(|header| {
            header
                .split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .filter(|(name, _)| !name.is_empty())
                .ok_or_else(|| AppError::InvalidInput(format!("Invalid header format: {header}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_stream_manifest() {
        let raw = br#"{"name": "video", "segments": [{"id": 0, "url": "http://a/0.ts", "path": "out/0.ts"}]}"#;
        let streams = parse_manifest(raw).unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].segments[0].url, "http://a/0.ts");
    }

    #[test]
    fn stream_list_manifest() {
        let raw = br#"[
            {"name": "video", "segments": []},
            {"name": "audio", "model": "mss", "segments": []}
        ]"#;
        let streams = parse_manifest(raw).unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[1].name, "audio");
    }

    #[test]
    fn empty_manifest_is_rejected() {
        assert!(matches!(
            parse_manifest(b"[]"),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn duplicate_segment_ids_are_rejected() {
        let raw = br#"{"name": "video", "segments": [
            {"id": 3, "url": "http://a/3.ts", "path": "out/3.ts"},
            {"id": 3, "url": "http://a/3b.ts", "path": "out/3b.ts"}
        ]}"#;
        let err = parse_manifest(raw).unwrap_err();
        assert!(err.to_string().contains("#3"));
    }

    #[test]
    fn params_split_at_first_equals() {
        let parsed = parse_params(&["token=a=b".to_string()]).unwrap();
        assert_eq!(parsed, vec![("token".to_string(), "a=b".to_string())]);
        assert!(parse_params(&["broken".to_string()]).is_err());
    }

    #[test]
    fn headers_are_trimmed() {
        let parsed = parse_headers(&["Referer:  https://site/ ".to_string()]).unwrap();
        assert_eq!(
            parsed,
            vec![("Referer".to_string(), "https://site/".to_string())]
        );
        assert!(parse_headers(&[": value".to_string()]).is_err());
    }
}
