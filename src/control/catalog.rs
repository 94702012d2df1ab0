use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::core::config::{CatalogConfig, RenditionProfile};
use crate::core::error::{CatalogError, StorageError};
use crate::core::security::{validate_stream_name, SEGMENT_EXTENSION};
use crate::core::types::StreamRendition;
use crate::package::manifest::{
    master_playlist_path, media_playlist_path, parse_master, rendition_prefix, stream_prefix,
    VariantEntry, MASTER_PLAYLIST,
};
use crate::storage::cache::TtlCache;
use crate::storage::{ContentStore, ObjectMetadata};

/// Master playlists are tiny; anything bigger is not one of ours.
const MAX_MASTER_PLAYLIST_BYTES: u64 = 1024 * 1024;

const LIST_CACHE_KEY: &str = "";

// ---------------------------------------------------------------------------
// Catalog views
// ---------------------------------------------------------------------------

/// A rendition as found in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenditionSummary {
    #[serde(flatten)]
    pub rendition: StreamRendition,
    pub segment_count: usize,
    /// Sum of this rendition's segment sizes.
    pub size_bytes: u64,
}

/// A packaged stream, derived from the objects under `<name>/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stream {
    pub name: String,
    pub master_playlist_path: String,
    /// Master playlist order.
    pub renditions: Vec<RenditionSummary>,
    pub created_at: DateTime<Utc>,
    pub total_size_bytes: u64,
}

// ---------------------------------------------------------------------------
// Stream catalog
// ---------------------------------------------------------------------------

/// Discovers packaged streams by inspecting the package backend.
///
/// There is no persisted index: every miss re-reads storage. Results are held
/// in a short-TTL read-through cache, invalidated by `delete` and by job
/// publication.
pub struct StreamCatalog<S: ContentStore> {
    store: Arc<S>,
    streams: TtlCache<Stream>,
    listing: TtlCache<Vec<Stream>>,
    ladder: Vec<RenditionProfile>,
}

impl<S: ContentStore> StreamCatalog<S> {
    /// `ladder` is used to split a master playlist's advertised bandwidth back
    /// into video and audio bitrates.
    pub fn new(store: Arc<S>, config: &CatalogConfig, ladder: Vec<RenditionProfile>) -> Self {
        Self {
            store,
            streams: TtlCache::from_config("streams", config),
            listing: TtlCache::from_config("stream_list", config),
            ladder,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Every available stream (master playlist present), sorted by name.
    pub async fn list(&self) -> Result<Vec<Stream>, CatalogError> {
        if let Some(streams) = self.listing.get(LIST_CACHE_KEY) {
            return Ok(streams);
        }

        let objects = self.store.list("").await?;
        let mut by_stream: BTreeMap<&str, Vec<&ObjectMetadata>> = BTreeMap::new();
        for object in &objects {
            if let Some((stream, _)) = object.name.split_once('/') {
                by_stream.entry(stream).or_default().push(object);
            }
        }

        let mut streams = Vec::with_capacity(by_stream.len());
        for (name, objects) in by_stream {
            if validate_stream_name(name).is_err() {
                continue;
            }
            if let Some(stream) = self.build_stream(name, &objects).await? {
                self.streams.insert(name, stream.clone());
                streams.push(stream);
            }
        }

        debug!(count = streams.len(), "stream catalog listed");
        self.listing.insert(LIST_CACHE_KEY, streams.clone());
        Ok(streams)
    }

    /// True once the stream's master playlist is present.
    pub async fn exists(&self, name: &str) -> Result<bool, CatalogError> {
        check_name(name)?;
        match self.store.stat(&master_playlist_path(name)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Full view of one stream.
    pub async fn inspect(&self, name: &str) -> Result<Stream, CatalogError> {
        check_name(name)?;
        if let Some(stream) = self.streams.get(name) {
            return Ok(stream);
        }

        let objects = self.store.list(&stream_prefix(name)).await?;
        let refs: Vec<&ObjectMetadata> = objects.iter().collect();
        let stream = self
            .build_stream(name, &refs)
            .await?
            .ok_or_else(|| CatalogError::NotFound {
                name: name.to_string(),
            })?;
        self.streams.insert(name, stream.clone());
        Ok(stream)
    }

    pub async fn qualities(&self, name: &str) -> Result<Vec<StreamRendition>, CatalogError> {
        Ok(self
            .inspect(name)
            .await?
            .renditions
            .into_iter()
            .map(|summary| summary.rendition)
            .collect())
    }

    /// Sum of all rendition segment bytes.
    pub async fn total_size(&self, name: &str) -> Result<u64, CatalogError> {
        Ok(self.inspect(name).await?.total_size_bytes)
    }

    /// Remove every object under `<name>/`. Only a stream whose master
    /// playlist is present can be deleted; anything else is `NotFound` and
    /// nothing is touched. Uploads may share the backend root, so a bare
    /// directory is never treated as a stream.
    pub async fn delete(&self, name: &str) -> Result<u64, CatalogError> {
        if !self.exists(name).await? {
            return Err(CatalogError::NotFound {
                name: name.to_string(),
            });
        }

        let deleted = self.store.delete_prefix(&stream_prefix(name)).await?;
        self.invalidate(name);
        info!(stream = %name, deleted, "stream deleted");
        Ok(deleted)
    }

    /// Drop cached views touching `name`.
    pub fn invalidate(&self, name: &str) {
        self.streams.invalidate(name);
        self.listing.invalidate(LIST_CACHE_KEY);
    }

    async fn build_stream(
        &self,
        name: &str,
        objects: &[&ObjectMetadata],
    ) -> Result<Option<Stream>, CatalogError> {
        let master_path = master_playlist_path(name);
        let Some(master) = objects.iter().find(|o| o.name == master_path) else {
            return Ok(None);
        };

        let text = match self.store.open_full(&master_path).await {
            Ok(body) => body.read_to_bytes(MAX_MASTER_PLAYLIST_BYTES).await?,
            // Deleted between the listing and the read.
            Err(StorageError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let variants = parse_master(&String::from_utf8_lossy(&text));

        let mut renditions = Vec::with_capacity(variants.len());
        for variant in &variants {
            let segment_prefix = format!("{}/", rendition_prefix(name, &variant.rendition));
            let (segment_count, size_bytes) = objects
                .iter()
                .filter(|o| o.name.starts_with(&segment_prefix) && o.name.ends_with(SEGMENT_EXTENSION))
                .fold((0usize, 0u64), |(count, size), o| (count + 1, size + o.size_bytes));

            renditions.push(RenditionSummary {
                rendition: self.rendition_from_variant(name, variant),
                segment_count,
                size_bytes,
            });
        }

        let total_size_bytes = renditions.iter().map(|r| r.size_bytes).sum();
        Ok(Some(Stream {
            name: name.to_string(),
            master_playlist_path: master_path,
            renditions,
            created_at: master.last_modified,
            total_size_bytes,
        }))
    }

    fn rendition_from_variant(&self, name: &str, variant: &VariantEntry) -> StreamRendition {
        let (video_bitrate_bps, audio_bitrate_bps) = self
            .ladder
            .iter()
            .find(|p| p.name == variant.rendition)
            .map(|p| {
                (
                    u64::from(p.video_bitrate_kbps) * 1000,
                    u64::from(p.audio_bitrate_kbps) * 1000,
                )
            })
            .filter(|(v, a)| v + a == variant.bandwidth_bps)
            .unwrap_or((variant.bandwidth_bps, 0));

        StreamRendition {
            name: variant.rendition.clone(),
            width: variant.width,
            height: variant.height,
            video_bitrate_bps,
            audio_bitrate_bps,
            media_playlist_path: media_playlist_path(name, &variant.rendition),
            segment_directory: rendition_prefix(name, &variant.rendition),
        }
    }
}

fn check_name(name: &str) -> Result<(), CatalogError> {
    validate_stream_name(name).map_err(|reason| CatalogError::InvalidName {
        name: name.to_string(),
        reason,
    })?;
    if name == MASTER_PLAYLIST {
        return Err(CatalogError::InvalidName {
            name: name.to_string(),
            reason: "reserved name".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::config::default_ladder;
    use crate::package::manifest::build_master;
    use crate::storage::{InMemoryStore, LocalStore};
    use crate::transcode::profile::specs_from_ladder;
    use bytes::Bytes;

    fn no_cache() -> CatalogConfig {
        CatalogConfig {
            cache_ttl_secs: 0,
            cache_capacity: 0,
        }
    }

    /// Lay out a complete package: master, media playlists and
    /// `segments` segments of `segment_size` bytes per rendition.
    pub(crate) async fn publish_fixture<S: ContentStore>(
        store: &S,
        name: &str,
        segments: usize,
        segment_size: usize,
    ) {
        let renditions: Vec<StreamRendition> = specs_from_ladder(&default_ladder())
            .iter()
            .map(|s| s.to_rendition(name))
            .collect();
        for r in &renditions {
            for i in 0..segments {
                store
                    .put(
                        &format!("{}/segment_{:03}.ts", r.segment_directory, i),
                        Bytes::from(vec![0u8; segment_size]),
                        "video/mp2t",
                    )
                    .await
                    .unwrap();
            }
            store
                .put(
                    &r.media_playlist_path,
                    Bytes::from_static(b"#EXTM3U\n#EXTINF:10.0,\nsegment_000.ts\n#EXT-X-ENDLIST\n"),
                    "application/vnd.apple.mpegurl",
                )
                .await
                .unwrap();
        }
        store
            .put(
                &master_playlist_path(name),
                Bytes::from(build_master(&renditions, name)),
                "application/vnd.apple.mpegurl",
            )
            .await
            .unwrap();
    }

    fn catalog(store: Arc<InMemoryStore>, config: &CatalogConfig) -> StreamCatalog<InMemoryStore> {
        StreamCatalog::new(store, config, default_ladder())
    }

    #[tokio::test]
    async fn test_inspect_reports_renditions_and_sizes() {
        let store = Arc::new(InMemoryStore::new());
        publish_fixture(store.as_ref(), "show", 2, 100).await;
        let catalog = catalog(store, &no_cache());

        let stream = catalog.inspect("show").await.unwrap();
        assert_eq!(stream.master_playlist_path, "show/master.m3u8");
        let names: Vec<&str> = stream.renditions.iter().map(|r| r.rendition.name.as_str()).collect();
        assert_eq!(names, vec!["720p", "480p", "360p"]);
        assert!(stream.renditions.iter().all(|r| r.segment_count == 2 && r.size_bytes == 200));
        assert_eq!(stream.total_size_bytes, 600);
        assert_eq!(catalog.total_size("show").await.unwrap(), 600);

        let qualities = catalog.qualities("show").await.unwrap();
        assert_eq!(qualities[0].video_bitrate_bps, 2_500_000);
        assert_eq!(qualities[0].audio_bitrate_bps, 128_000);
        assert_eq!(qualities[2].media_playlist_path, "show/360p/playlist.m3u8");
        assert_eq!((qualities[1].width, qualities[1].height), (854, 480));
    }

    #[tokio::test]
    async fn test_stream_without_master_is_not_available() {
        let store = Arc::new(InMemoryStore::new());
        store
            .put("partial/720p/segment_000.ts", Bytes::from_static(b"x"), "video/mp2t")
            .await
            .unwrap();
        publish_fixture(store.as_ref(), "done", 1, 10).await;
        let catalog = catalog(store, &no_cache());

        assert!(!catalog.exists("partial").await.unwrap());
        assert!(matches!(
            catalog.inspect("partial").await,
            Err(CatalogError::NotFound { .. })
        ));
        let listed: Vec<String> = catalog.list().await.unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(listed, vec!["done"]);
    }

    #[tokio::test]
    async fn test_unknown_ladder_entry_keeps_bandwidth_as_video() {
        let store = Arc::new(InMemoryStore::new());
        publish_fixture(store.as_ref(), "show", 1, 10).await;
        let catalog = StreamCatalog::new(store, &no_cache(), Vec::new());

        let qualities = catalog.qualities("show").await.unwrap();
        assert_eq!(qualities[0].video_bitrate_bps, 2_628_000);
        assert_eq!(qualities[0].audio_bitrate_bps, 0);
        assert_eq!(qualities[0].bandwidth_bps(), 2_628_000);
    }

    #[tokio::test]
    async fn test_delete_removes_tree() {
        let store = Arc::new(InMemoryStore::new());
        publish_fixture(store.as_ref(), "show", 2, 10).await;
        publish_fixture(store.as_ref(), "other", 1, 10).await;
        let catalog = catalog(store.clone(), &CatalogConfig::default());

        assert!(catalog.exists("show").await.unwrap());
        assert_eq!(catalog.list().await.unwrap().len(), 2);

        let deleted = catalog.delete("show").await.unwrap();
        assert_eq!(deleted, 1 + 3 * (1 + 2));
        assert!(!catalog.exists("show").await.unwrap());
        assert!(matches!(catalog.inspect("show").await, Err(CatalogError::NotFound { .. })));
        assert_eq!(catalog.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found_without_side_effects() {
        let store = Arc::new(InMemoryStore::new());
        publish_fixture(store.as_ref(), "show", 1, 10).await;
        let before = store.object_count().await;
        let catalog = catalog(store.clone(), &no_cache());

        assert!(matches!(
            catalog.delete("nope").await,
            Err(CatalogError::NotFound { .. })
        ));
        // Prefix matching is per directory: "sho" must not touch "show/".
        assert!(matches!(
            catalog.delete("sho").await,
            Err(CatalogError::NotFound { .. })
        ));
        assert_eq!(store.object_count().await, before);
    }

    #[tokio::test]
    async fn test_delete_leaves_upload_directories_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));
        store
            .put("incoming/raw.mp4", Bytes::from_static(b"raw upload"), "video/mp4")
            .await
            .unwrap();
        publish_fixture(store.as_ref(), "show", 1, 10).await;
        let catalog = StreamCatalog::new(store.clone(), &no_cache(), default_ladder());

        assert!(!catalog.exists("incoming").await.unwrap());
        assert!(matches!(
            catalog.delete("incoming").await,
            Err(CatalogError::NotFound { .. })
        ));
        assert_eq!(store.stat("incoming/raw.mp4").await.unwrap().size_bytes, 10);

        catalog.delete("show").await.unwrap();
        assert!(store.stat("incoming/raw.mp4").await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let catalog = catalog(Arc::new(InMemoryStore::new()), &no_cache());
        for name in ["", "../etc", "a/b", ".hidden"] {
            assert!(matches!(
                catalog.exists(name).await,
                Err(CatalogError::InvalidName { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_cached_view_until_invalidated() {
        let store = Arc::new(InMemoryStore::new());
        publish_fixture(store.as_ref(), "show", 1, 10).await;
        let catalog = catalog(store.clone(), &CatalogConfig::default());

        assert_eq!(catalog.total_size("show").await.unwrap(), 30);
        store
            .put("show/720p/segment_001.ts", Bytes::from(vec![0u8; 5]), "video/mp2t")
            .await
            .unwrap();
        assert_eq!(catalog.total_size("show").await.unwrap(), 30);

        catalog.invalidate("show");
        assert_eq!(catalog.total_size("show").await.unwrap(), 35);
    }
}
