//! The image store: reference index plus orchestration of pull, push,
//! import, export, tag, prune, and unpack.
//!
//! Long I/O (network, blob streaming) runs outside the store lock; only
//! the final commit — promoting staged content and rewriting
//! `state.json` — is serialized. A committed image is atomic: readers
//! either see no mapping or a fully-present one.

use std::collections::HashSet;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use skiff_oci::media_types;
use skiff_oci::{
    ContentClient, Descriptor, Digest, DigestWriter, ImageConfig, Index, LayoutClient, Manifest,
    Platform, ProgressEvent, ProgressHandler, PushSource, Reference, RootFs, RuntimeConfig, emit,
};

use crate::content::{ContentStore, IngestSession};
use crate::lock::AsyncLock;
use crate::state::ReferenceIndex;
use crate::{Error, Result};

/// Bounded parallelism for blob transfers.
const TRANSFER_CHUNK: usize = 8;
/// Blobs above this size stream to a file instead of buffering.
const LARGE_BLOB_BYTES: i64 = 1024 * 1024;
/// Default ext4 image capacity for unpack.
const DEFAULT_UNPACK_BYTES: u64 = 1024 * 1024 * 1024;

/// A stored image: a reference bound to a root descriptor.
///
/// Mappings are never mutated in place — a rename is delete plus create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    reference: String,
    descriptor: Descriptor,
}

impl Image {
    /// The normalized reference string.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// The root (index or manifest) descriptor.
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// The root content digest.
    pub fn digest(&self) -> &Digest {
        &self.descriptor.digest
    }
}

/// Content-addressed image store rooted at one directory.
#[derive(Debug)]
pub struct ImageStore {
    content: ContentStore,
    index: std::sync::Mutex<ReferenceIndex>,
    lock: AsyncLock,
}

impl ImageStore {
    /// Opens (or creates) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let content = ContentStore::new(&root)?;
        let index = ReferenceIndex::load(&root)?;
        Ok(Self {
            content,
            index: std::sync::Mutex::new(index),
            lock: AsyncLock::new(),
        })
    }

    /// The underlying content store.
    pub fn content_store(&self) -> &ContentStore {
        &self.content
    }

    fn index_guard(&self) -> std::sync::MutexGuard<'_, ReferenceIndex> {
        self.index.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// All stored images, unordered.
    pub fn list(&self) -> Vec<Image> {
        self.index_guard()
            .list()
            .map(|(reference, descriptor)| Image {
                reference: reference.clone(),
                descriptor: descriptor.clone(),
            })
            .collect()
    }

    /// Looks up an image by reference.
    pub fn get(&self, reference: &str) -> Result<Image> {
        let normalized = normalize(reference)?;
        self.index_guard()
            .get(&normalized)
            .map(|descriptor| Image {
                reference: normalized.clone(),
                descriptor: descriptor.clone(),
            })
            .ok_or(Error::NotFound(normalized))
    }

    /// Binds a second reference to an existing image's descriptor.
    pub async fn tag(&self, existing: &str, new: &str) -> Result<Image> {
        let image = self.get(existing)?;
        let new_reference = normalize(new)?;
        let descriptor = image.descriptor.clone();
        self.lock
            .with_lock(async {
                let mut index = self.index_guard();
                index.reload()?;
                index.insert(new_reference.clone(), descriptor.clone());
                index.save()
            })
            .await?;
        tracing::debug!(from = %image.reference, to = %new_reference, "tagged image");
        Ok(Image {
            reference: new_reference,
            descriptor,
        })
    }

    /// Removes a reference mapping. Content is reclaimed by [`Self::prune`].
    pub async fn delete(&self, reference: &str) -> Result<()> {
        let normalized = normalize(reference)?;
        self.lock
            .with_lock(async {
                let mut index = self.index_guard();
                index.reload()?;
                if index.remove(&normalized).is_none() {
                    return Err(Error::NotFound(normalized.clone()));
                }
                index.save()
            })
            .await
    }

    /// Pulls an image from a client, filters by platform, and registers
    /// the reference. Dropping the future cancels the ingest session.
    pub async fn pull<C: ContentClient>(
        &self,
        reference: &str,
        client: &C,
        platform: Option<&Platform>,
        progress: Option<&ProgressHandler>,
    ) -> Result<Image> {
        let parsed = Reference::parse(reference)?.normalize()?;
        let name = parsed.path().to_owned();
        let identifier = parsed
            .identifier()
            .ok_or_else(|| Error::InvalidArgument(format!("unresolvable reference {parsed}")))?;
        let root = client.resolve(&name, &identifier).await?;
        self.pull_descriptor(parsed.to_string(), &name, root, client, platform, progress)
            .await
    }

    /// Pulls content reachable from an already-resolved root descriptor.
    async fn pull_descriptor<C: ContentClient>(
        &self,
        reference: String,
        name: &str,
        root: Descriptor,
        client: &C,
        platform: Option<&Platform>,
        progress: Option<&ProgressHandler>,
    ) -> Result<Image> {
        if !media_types::is_image_target(&root.media_type) {
            return Err(Error::Unsupported(format!(
                "cannot pull {} content",
                root.media_type
            )));
        }
        tracing::debug!(%reference, digest = %root.digest, "pulling image");
        emit(
            progress,
            &[
                ProgressEvent::AddTotalItems(1),
                ProgressEvent::AddTotalSize(root.size.max(0) as u64),
            ],
        );

        let mut session = self.content.new_ingest_session().await?;
        let walked = self
            .pull_walk(session.dir().to_owned(), name, &root, client, platform, progress)
            .await;
        match walked {
            Ok(mapped_root) => {
                self.lock
                    .with_lock(async {
                        self.content.complete_ingest_session(&mut session).await?;
                        let mut index = self.index_guard();
                        index.reload()?;
                        index.insert(reference.clone(), mapped_root.clone());
                        index.save()
                    })
                    .await?;
                Ok(Image {
                    reference,
                    descriptor: mapped_root,
                })
            }
            Err(err) => {
                let _ = self.content.cancel_ingest_session(session).await;
                Err(err)
            }
        }
    }

    /// Breadth-first fetch of everything reachable from `root` into the
    /// staging directory. Returns the descriptor the reference should
    /// map to (the root, or a synthesized index for a bare manifest).
    async fn pull_walk<C: ContentClient>(
        &self,
        staging: PathBuf,
        name: &str,
        root: &Descriptor,
        client: &C,
        platform: Option<&Platform>,
        progress: Option<&ProgressHandler>,
    ) -> Result<Descriptor> {
        let mut seen: HashSet<String> = HashSet::from([root.digest.hex().to_owned()]);
        let mut frontier = vec![root.clone()];
        while !frontier.is_empty() {
            for chunk in frontier.chunks(TRANSFER_CHUNK) {
                futures_util::future::try_join_all(
                    chunk
                        .iter()
                        .map(|d| self.fetch_content(&staging, name, d, client, progress)),
                )
                .await?;
            }

            let mut next = Vec::new();
            for descriptor in &frontier {
                for child in self
                    .children_of(&staging, descriptor, platform)
                    .await?
                {
                    if seen.insert(child.digest.hex().to_owned()) {
                        emit(
                            progress,
                            &[
                                ProgressEvent::AddTotalItems(1),
                                ProgressEvent::AddTotalSize(child.size.max(0) as u64),
                            ],
                        );
                        next.push(child);
                    }
                }
            }
            frontier = next;
        }

        if media_types::is_manifest(&root.media_type) {
            self.synthesize_index(&staging, root, platform).await
        } else {
            Ok(root.clone())
        }
    }

    /// Fetches one descriptor's content into staging unless the store or
    /// the session already holds it.
    async fn fetch_content<C: ContentClient>(
        &self,
        staging: &Path,
        name: &str,
        descriptor: &Descriptor,
        client: &C,
        progress: Option<&ProgressHandler>,
    ) -> Result<()> {
        if self.content.get(&descriptor.digest).await?.is_some() {
            emit(
                progress,
                &[
                    ProgressEvent::AddItems(1),
                    ProgressEvent::AddSize(descriptor.size.max(0) as u64),
                ],
            );
            return Ok(());
        }
        let staged = staging.join(descriptor.digest.hex());
        if tokio::fs::metadata(&staged).await.is_ok() {
            return Ok(());
        }

        if descriptor.size > LARGE_BLOB_BYTES {
            // streams straight to the staging file, hashing on the way
            client
                .fetch_blob(name, descriptor, &staged, progress)
                .await?;
            emit(progress, &[ProgressEvent::AddItems(1)]);
        } else {
            // small content is buffered and digest-checked before the write
            let data = client.fetch_data(name, descriptor).await?;
            let actual = Digest::compute(&data);
            if actual != descriptor.digest {
                return Err(Error::Internal(format!(
                    "content for {} hashed to {actual}",
                    descriptor.digest
                )));
            }
            tokio::fs::write(&staged, &data).await?;
            emit(
                progress,
                &[
                    ProgressEvent::AddItems(1),
                    ProgressEvent::AddSize(data.len() as u64),
                ],
            );
        }
        Ok(())
    }

    /// The descriptors one edge below `descriptor` in the content graph.
    async fn children_of(
        &self,
        staging: &Path,
        descriptor: &Descriptor,
        platform: Option<&Platform>,
    ) -> Result<Vec<Descriptor>> {
        if media_types::is_index(&descriptor.media_type) {
            let index: Index = self.read_walk_json(staging, descriptor).await?;
            let mut children = Vec::new();
            for entry in index.manifests {
                if media_types::is_unsupported(&entry.media_type) {
                    return Err(Error::Unsupported(format!(
                        "artifact content {}",
                        entry.media_type
                    )));
                }
                if let Some(platform) = platform {
                    let matched = entry
                        .platform
                        .as_ref()
                        .is_some_and(|candidate| platform.matches(candidate));
                    if !matched {
                        continue;
                    }
                }
                children.push(entry);
            }
            Ok(children)
        } else if media_types::is_manifest(&descriptor.media_type) {
            let manifest: Manifest = self.read_walk_json(staging, descriptor).await?;
            let mut children = vec![manifest.config];
            for layer in manifest.layers {
                if media_types::is_foreign_layer(&layer.media_type) {
                    tracing::debug!(digest = %layer.digest, "skipping foreign layer");
                    continue;
                }
                children.push(layer);
            }
            Ok(children)
        } else {
            Ok(Vec::new())
        }
    }

    /// Reads JSON content that is either committed or still staged.
    async fn read_walk_json<T: serde::de::DeserializeOwned>(
        &self,
        staging: &Path,
        descriptor: &Descriptor,
    ) -> Result<T> {
        if let Some(handle) = self.content.get(&descriptor.digest).await? {
            return handle.json().await;
        }
        let raw = tokio::fs::read(staging.join(descriptor.digest.hex())).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Wraps a bare manifest in a one-entry index, stamping the entry's
    /// platform from the image config.
    async fn synthesize_index(
        &self,
        staging: &Path,
        root: &Descriptor,
        platform: Option<&Platform>,
    ) -> Result<Descriptor> {
        let manifest: Manifest = self.read_walk_json(staging, root).await?;
        let config: ImageConfig = self.read_walk_json(staging, &manifest.config).await?;
        let stamped = config.platform();
        if let Some(requested) = platform {
            if !requested.matches(&stamped) {
                return Err(Error::NotFound(format!(
                    "image provides {stamped}, not {requested}"
                )));
            }
        }

        let mut entry = root.clone();
        entry.platform = Some(stamped);
        let index = Index::new(vec![entry]);
        let data = serde_json::to_vec(&index)?;
        let digest = Digest::compute(&data);
        let descriptor = Descriptor::new(media_types::INDEX, digest.clone(), data.len() as i64);
        tokio::fs::write(staging.join(digest.hex()), &data).await?;
        Ok(descriptor)
    }

    /// Pushes an image to a client, leaves first, so children always
    /// exist before anything referencing them.
    pub async fn push<C: ContentClient>(
        &self,
        reference: &str,
        client: &C,
        platform: Option<&Platform>,
        progress: Option<&ProgressHandler>,
    ) -> Result<()> {
        let image = self.get(reference)?;
        self.push_image(&image, client, platform, progress).await?;
        Ok(())
    }

    /// Pushes `image` and returns the root descriptor that ended up on
    /// the remote (the original, or a platform-filtered index).
    async fn push_image<C: ContentClient>(
        &self,
        image: &Image,
        client: &C,
        platform: Option<&Platform>,
        progress: Option<&ProgressHandler>,
    ) -> Result<Descriptor> {
        let parsed = Reference::parse(&image.reference)?;
        let name = parsed.path().to_owned();
        let root = &image.descriptor;
        let filtering = platform.is_some() && media_types::is_index(&root.media_type);

        // level k holds the unique descriptors k edges from the root
        let mut levels: Vec<Vec<Descriptor>> = Vec::new();
        let mut seen: HashSet<String> = HashSet::from([root.digest.hex().to_owned()]);
        let mut matching_manifests: Vec<Descriptor> = Vec::new();
        let mut current = vec![root.clone()];
        while !current.is_empty() {
            let mut next = Vec::new();
            for descriptor in &current {
                let children = self
                    .stored_children(descriptor, platform, &mut matching_manifests)
                    .await?;
                for child in children {
                    if seen.insert(child.digest.hex().to_owned()) {
                        next.push(child);
                    }
                }
            }
            levels.push(current);
            current = next;
        }

        let total: u64 = levels.iter().flatten().count() as u64;
        let total_size: u64 = levels
            .iter()
            .flatten()
            .map(|d| d.size.max(0) as u64)
            .sum();
        emit(
            progress,
            &[
                ProgressEvent::AddTotalItems(total),
                ProgressEvent::AddTotalSize(total_size),
            ],
        );

        for level in levels.iter().rev() {
            for chunk in level.chunks(TRANSFER_CHUNK) {
                futures_util::future::try_join_all(chunk.iter().map(|descriptor| {
                    self.push_one(&name, &image.reference, descriptor, root, filtering, client, progress)
                }))
                .await?;
            }
        }

        if filtering {
            let index = Index::new(matching_manifests);
            let data = serde_json::to_vec(&index)?;
            let digest = Digest::compute(&data);
            let descriptor =
                Descriptor::new(media_types::INDEX, digest, data.len() as i64);
            self.push_source(
                &name,
                &image.reference,
                &descriptor,
                PushSource::Bytes(data),
                client,
                progress,
            )
            .await?;
            tracing::debug!(reference = %image.reference, "pushed filtered image");
            Ok(descriptor)
        } else {
            tracing::debug!(reference = %image.reference, "pushed image");
            Ok(root.clone())
        }
    }

    /// Children of a committed descriptor, read from the content store.
    /// Matching manifests are collected for filtered-index synthesis.
    async fn stored_children(
        &self,
        descriptor: &Descriptor,
        platform: Option<&Platform>,
        matching_manifests: &mut Vec<Descriptor>,
    ) -> Result<Vec<Descriptor>> {
        let handle = self
            .content
            .get(&descriptor.digest)
            .await?
            .ok_or_else(|| Error::NotFound(descriptor.digest.to_string()))?;
        if media_types::is_index(&descriptor.media_type) {
            let index: Index = handle.json().await?;
            let mut children = Vec::new();
            for entry in index.manifests {
                if let Some(platform) = platform {
                    let matched = entry
                        .platform
                        .as_ref()
                        .is_some_and(|candidate| platform.matches(candidate));
                    if !matched {
                        continue;
                    }
                    matching_manifests.push(entry.clone());
                }
                children.push(entry);
            }
            Ok(children)
        } else if media_types::is_manifest(&descriptor.media_type) {
            let manifest: Manifest = handle.json().await?;
            let mut children = vec![manifest.config];
            children.extend(
                manifest
                    .layers
                    .into_iter()
                    .filter(|l| !media_types::is_foreign_layer(&l.media_type)),
            );
            Ok(children)
        } else {
            Ok(Vec::new())
        }
    }

    async fn push_one<C: ContentClient>(
        &self,
        name: &str,
        reference: &str,
        descriptor: &Descriptor,
        root: &Descriptor,
        filtering: bool,
        client: &C,
        progress: Option<&ProgressHandler>,
    ) -> Result<()> {
        let is_root = descriptor.digest == root.digest;
        if is_root && filtering {
            // replaced by the synthesized filtered index
            return Ok(());
        }
        let handle = self
            .content
            .get(&descriptor.digest)
            .await?
            .ok_or_else(|| Error::NotFound(descriptor.digest.to_string()))?;
        let push_reference = if is_root {
            reference.to_owned()
        } else {
            format!("{name}@{}", descriptor.digest)
        };
        self.push_source(
            name,
            &push_reference,
            descriptor,
            PushSource::File(handle.path().to_owned()),
            client,
            progress,
        )
        .await
    }

    /// Pushes one source, treating "already exists" as success.
    async fn push_source<C: ContentClient>(
        &self,
        name: &str,
        reference: &str,
        descriptor: &Descriptor,
        source: PushSource,
        client: &C,
        progress: Option<&ProgressHandler>,
    ) -> Result<()> {
        match client
            .push(name, reference, descriptor, source, progress)
            .await
        {
            Ok(()) => Ok(()),
            Err(skiff_oci::Error::Exists(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Imports every annotated image from an OCI layout directory.
    pub async fn import(
        &self,
        layout: &LayoutClient,
        progress: Option<&ProgressHandler>,
    ) -> Result<Vec<Image>> {
        let index = layout.index().await?;
        let mut images = Vec::new();
        for descriptor in index.manifests {
            let Some(reference) = LayoutClient::image_reference_from_descriptor(&descriptor)
            else {
                tracing::debug!(digest = %descriptor.digest, "skipping unnamed manifest");
                continue;
            };
            let normalized = normalize(reference)?;
            let mut root = descriptor.clone();
            root.annotations = None;
            let image = self
                .pull_descriptor(normalized, "", root, layout, None, progress)
                .await?;
            images.push(image);
        }
        Ok(images)
    }

    /// Exports images into an OCI layout directory at `dir`.
    pub async fn export(
        &self,
        references: &[&str],
        dir: &Path,
        platform: Option<&Platform>,
        progress: Option<&ProgressHandler>,
    ) -> Result<()> {
        let layout = LayoutClient::create(dir).await?;
        let mut top_level = Vec::new();
        for reference in references {
            let image = self.get(reference)?;
            let mut root = self.push_image(&image, &layout, platform, progress).await?;
            LayoutClient::set_image_reference_annotation(&mut root, &image.reference);
            top_level.push(root);
        }
        layout.write_index(&Index::new(top_level)).await?;
        Ok(())
    }

    /// Every content digest reachable from a stored image.
    pub async fn referenced_digests(&self) -> Result<HashSet<String>> {
        let mut keep = HashSet::new();
        for image in self.list() {
            let mut frontier = vec![image.descriptor.clone()];
            while let Some(descriptor) = frontier.pop() {
                if !keep.insert(descriptor.digest.hex().to_owned()) {
                    continue;
                }
                if self.content.get(&descriptor.digest).await?.is_some() {
                    frontier.extend(
                        self.stored_children(&descriptor, None, &mut Vec::new())
                            .await?,
                    );
                }
            }
        }
        Ok(keep)
    }

    /// Deletes every blob not reachable from a stored image.
    ///
    /// Holds the store lock for its entire duration, so no image
    /// operation runs concurrently.
    pub async fn prune(&self) -> Result<(Vec<String>, u64)> {
        self.lock
            .with_lock(async {
                let keep = self.referenced_digests().await?;
                self.content.delete(&keep).await
            })
            .await
    }

    /// Builds an image locally from gzip-compressed layer tars and
    /// registers it under `reference`.
    ///
    /// Diff IDs in the config are digests of the *uncompressed* tars,
    /// computed by decompressing each layer while it is ingested.
    pub async fn create(
        &self,
        reference: &str,
        layers: &[PathBuf],
        platform: &Platform,
        runtime: Option<RuntimeConfig>,
    ) -> Result<Image> {
        let normalized = normalize(reference)?;
        let mut session = self.content.new_ingest_session().await?;
        let built = build_image_blobs(session.dir(), layers, platform, runtime);
        match built {
            Ok(root) => {
                self.lock
                    .with_lock(async {
                        self.content.complete_ingest_session(&mut session).await?;
                        let mut index = self.index_guard();
                        index.reload()?;
                        index.insert(normalized.clone(), root.clone());
                        index.save()
                    })
                    .await?;
                Ok(Image {
                    reference: normalized,
                    descriptor: root,
                })
            }
            Err(err) => {
                let _ = self.content.cancel_ingest_session(session).await;
                Err(err)
            }
        }
    }

    /// Materializes an image's layers for `platform` into an ext4 block
    /// image at `dest`.
    pub async fn unpack(
        &self,
        reference: &str,
        platform: &Platform,
        dest: &Path,
        size_bytes: Option<u64>,
    ) -> Result<()> {
        let image = self.get(reference)?;
        let handle = self
            .content
            .get(image.digest())
            .await?
            .ok_or_else(|| Error::NotFound(image.digest().to_string()))?;
        let index: Index = handle.json().await?;
        let manifest_descriptor = index
            .manifests
            .iter()
            .find(|entry| {
                entry
                    .platform
                    .as_ref()
                    .is_some_and(|candidate| platform.matches(candidate))
            })
            .ok_or_else(|| Error::NotFound(format!("{reference} has no {platform} manifest")))?;
        let manifest: Manifest = self
            .content
            .get(&manifest_descriptor.digest)
            .await?
            .ok_or_else(|| Error::NotFound(manifest_descriptor.digest.to_string()))?
            .json()
            .await?;

        let mut layer_files = Vec::new();
        for layer in &manifest.layers {
            if media_types::is_foreign_layer(&layer.media_type) {
                continue;
            }
            let handle = self
                .content
                .get(&layer.digest)
                .await?
                .ok_or_else(|| Error::NotFound(layer.digest.to_string()))?;
            let gzipped = layer.media_type.ends_with("+gzip")
                || layer.media_type.ends_with(".gzip");
            layer_files.push((handle.path().to_owned(), gzipped));
        }

        let dest = dest.to_owned();
        let capacity = size_bytes.unwrap_or(DEFAULT_UNPACK_BYTES);
        tracing::debug!(reference, %platform, dest = %dest.display(), "unpacking image");
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut writer = skiff_ext4::Ext4Writer::create(&dest, capacity)?;
            for (path, gzipped) in layer_files {
                let file = BufReader::new(std::fs::File::open(&path)?);
                if gzipped {
                    writer.append_layer(flate2::read::GzDecoder::new(file))?;
                } else {
                    writer.append_layer(file)?;
                }
            }
            writer.finish()?;
            Ok(())
        })
        .await
        .map_err(|err| Error::Internal(format!("unpack task failed: {err}")))?
    }
}

/// Parses and normalizes a reference into its canonical string form.
fn normalize(reference: &str) -> Result<String> {
    Ok(Reference::parse(reference)?.normalize()?.to_string())
}

/// Writes layer, config, manifest, and index blobs into a staging
/// directory and returns the root index descriptor.
fn build_image_blobs(
    staging: &Path,
    layers: &[PathBuf],
    platform: &Platform,
    runtime: Option<RuntimeConfig>,
) -> Result<Descriptor> {
    let mut layer_descriptors = Vec::new();
    let mut diff_ids = Vec::new();
    for (i, layer) in layers.iter().enumerate() {
        // compressed bytes become the layer blob
        let tmp = staging.join(format!("layer-{i}.partial"));
        let mut writer = DigestWriter::new(std::fs::File::create(&tmp)?);
        let mut reader = std::fs::File::open(layer)?;
        std::io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        let size = writer.written() as i64;
        let (_, digest) = writer.finish();
        std::fs::rename(&tmp, staging.join(digest.hex()))?;
        layer_descriptors.push(Descriptor::new(
            media_types::LAYER_GZIP,
            digest,
            size,
        ));

        // the diff ID is the digest of the uncompressed tar
        let file = BufReader::new(std::fs::File::open(layer)?);
        diff_ids.push(Digest::from_reader(flate2::read::GzDecoder::new(file))?);
    }

    let config = ImageConfig {
        architecture: platform.architecture.clone(),
        os: platform.os.clone(),
        variant: platform.variant.clone(),
        os_features: platform.os_features.clone(),
        created: None,
        config: runtime,
        rootfs: RootFs::layers(diff_ids),
    };
    let config_descriptor = write_json_blob(staging, media_types::IMAGE_CONFIG, &config)?;

    let manifest = Manifest::new(config_descriptor, layer_descriptors);
    let mut manifest_descriptor = write_json_blob(staging, media_types::MANIFEST, &manifest)?;
    manifest_descriptor.platform = Some(platform.clone());

    let index = Index::new(vec![manifest_descriptor]);
    write_json_blob(staging, media_types::INDEX, &index)
}

fn write_json_blob<T: serde::Serialize>(
    staging: &Path,
    media_type: &str,
    value: &T,
) -> Result<Descriptor> {
    let data = serde_json::to_vec(value)?;
    let digest = Digest::compute(&data);
    std::fs::write(staging.join(digest.hex()), &data)?;
    Ok(Descriptor::new(media_type, digest, data.len() as i64))
}
