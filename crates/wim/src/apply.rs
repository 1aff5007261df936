//! The extraction engine: orchestrates the multi-pass algorithm that
//! materializes an image tree through an applicator.
//!
//! One operation runs these passes over the requested subtree:
//!
//! 1. feature tally and capability check ([`features`]),
//! 2. per-dentry name computation with skip/rename policies ([`path`]),
//! 3. stream resolution and reference counting ([`index`]),
//! 4. skeleton materialization, interleaved with stream extraction for
//!    random-access sources or followed by an archive-order stream pass
//!    for sequential ones ([`skeleton`], [`extract`]),
//! 5. depth-first security and timestamp finalization ([`finalize`]).
//!
//! All transient state lives in the per-operation [`ApplyContext`] and is
//! dropped on return, so back-to-back operations see identical trees.

use std::fs;
use std::path::Path;

use log::warn;

use crate::backend::{Applicator, BackendOptions, VolumeCapabilities};
use crate::image::{DentryId, Image};
use crate::progress::{Progress, ProgressFn, ProgressMsg};
use crate::source::WimSource;
use crate::streams::{StreamId, StreamTable};
use crate::xml::WimInfo;
use crate::{Error, Result, WIM_HDR_FLAG_RP_FIX, WimArchive};

pub(crate) mod extract;
pub(crate) mod features;
pub(crate) mod index;
pub(crate) mod path;
pub(crate) mod reparse;
pub(crate) mod skeleton;

mod finalize;

pub use extract::extract_to_writer;

/// Extraction behavior flags. Mutually exclusive pairs are rejected by
/// the entry points; `rpfix`/`norpfix` default from the archive header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractFlags {
    /// Link every file carrying already-extracted contents instead of
    /// writing a second copy.
    pub hardlink: bool,
    /// Like `hardlink`, but emit relative symlinks.
    pub symlink: bool,
    /// Read the archive in offset order, in two passes.
    pub sequential: bool,
    /// Restore UNIX owner/group/mode instead of security descriptors.
    pub unix_data: bool,
    pub no_acls: bool,
    pub strict_acls: bool,
    /// Rewrite absolute link targets to point under the extraction root.
    pub rpfix: bool,
    pub norpfix: bool,
    pub strict_symlinks: bool,
    pub strict_short_names: bool,
    pub strict_timestamps: bool,
    /// Rename rather than skip entries with unrepresentable names.
    pub replace_invalid_filenames: bool,
    /// Rename rather than skip case-insensitive name collisions.
    pub all_case_conflicts: bool,
    /// Write the single requested file's contents to standard output.
    pub to_stdout: bool,
    /// The target is an NTFS volume applied through an NTFS applicator.
    pub ntfs: bool,
    pub(crate) from_pipe: bool,
    pub(crate) multi_image: bool,
}

impl ExtractFlags {
    pub fn is_linked(&self) -> bool {
        self.hardlink || self.symlink
    }

    /// Field-wise union, used to merge per-command flags over defaults.
    pub fn merge(self, other: ExtractFlags) -> ExtractFlags {
        ExtractFlags {
            hardlink: self.hardlink || other.hardlink,
            symlink: self.symlink || other.symlink,
            sequential: self.sequential || other.sequential,
            unix_data: self.unix_data || other.unix_data,
            no_acls: self.no_acls || other.no_acls,
            strict_acls: self.strict_acls || other.strict_acls,
            rpfix: self.rpfix || other.rpfix,
            norpfix: self.norpfix || other.norpfix,
            strict_symlinks: self.strict_symlinks || other.strict_symlinks,
            strict_short_names: self.strict_short_names || other.strict_short_names,
            strict_timestamps: self.strict_timestamps || other.strict_timestamps,
            replace_invalid_filenames: self.replace_invalid_filenames
                || other.replace_invalid_filenames,
            all_case_conflicts: self.all_case_conflicts || other.all_case_conflicts,
            to_stdout: self.to_stdout || other.to_stdout,
            ntfs: self.ntfs || other.ntfs,
            from_pipe: self.from_pipe || other.from_pipe,
            multi_image: self.multi_image || other.multi_image,
        }
    }

    /// Rejects contradictory flag combinations and empty targets.
    fn validate(&self, target: &str) -> Result<()> {
        if target.is_empty() {
            return Err(Error::InvalidParam("extraction target is empty"));
        }
        if self.hardlink && self.symlink {
            return Err(Error::InvalidParam(
                "HARDLINK and SYMLINK extraction are mutually exclusive",
            ));
        }
        if self.no_acls && self.strict_acls {
            return Err(Error::InvalidParam(
                "NO_ACLS and STRICT_ACLS are mutually exclusive",
            ));
        }
        if self.rpfix && self.norpfix {
            return Err(Error::InvalidParam(
                "RPFIX and NORPFIX are mutually exclusive",
            ));
        }
        Ok(())
    }

    /// Applies the defaults that depend on the archive header and the
    /// flag interactions that adjust rather than reject.
    fn resolve(mut self, header_flags: u32) -> ExtractFlags {
        if !self.rpfix && !self.norpfix && header_flags & WIM_HDR_FLAG_RP_FIX != 0 {
            self.rpfix = true;
        }
        // UNIX data is carried in file streams, which a fully sequential
        // read may deliver before the nodes they describe.
        if self.unix_data && self.sequential {
            if self.from_pipe {
                warn!(
                    "Setting the UNIX file owner/group may be impossible on some \
                     symbolic links when applying from a pipe"
                );
            } else {
                self.sequential = false;
                warn!("Disabling sequential extraction for UNIX data mode");
            }
        }
        self
    }
}

/// Which image(s) of an archive to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSelect {
    /// 1-based image index.
    Index(usize),
    /// Image name per the XML data.
    Name(String),
    /// Every image, each into its own subdirectory of the target.
    All,
}

/// One subtree to extract, as consumed by [`extract_files`].
#[derive(Debug, Clone)]
pub struct ExtractCommand {
    /// Canonical path inside the image; empty for the whole image.
    pub source_path: String,
    pub target: String,
    pub flags: ExtractFlags,
}

/// Per-dentry transient state for one operation.
#[derive(Debug, Default)]
pub(crate) struct DentryScratch {
    pub skipped: bool,
    pub was_linked: bool,
    pub tmp_flag: bool,
    /// Computed name in the backend's vocabulary; `None` until computed
    /// (and always `None` for the extraction root).
    pub name: Option<String>,
}

/// Per-inode transient state for one operation.
#[derive(Debug, Default)]
pub(crate) struct InodeScratch {
    pub visited: bool,
    /// First materialized path, target for further hard links.
    pub extracted_path: Option<String>,
    /// Resolved stream ids: index 0 is the unnamed stream, then one slot
    /// per ADS entry. Empty until the resolve pass runs.
    pub streams: Vec<Option<StreamId>>,
}

/// Per-descriptor transient state for one operation.
#[derive(Debug, Default)]
pub(crate) struct StreamScratch {
    /// Dentry slots still to satisfy from this stream.
    pub refcnt: u64,
    /// Dentries to realize from this stream, recorded only in
    /// sequential mode.
    pub dentries: index::DentryList,
}

/// Everything one extraction operation owns. Never shared across
/// threads; dropped (with all transient state) on return.
pub(crate) struct ApplyContext<'a, 'p> {
    pub image: &'a Image,
    pub streams: &'a mut StreamTable,
    pub source: &'a mut dyn WimSource,
    pub backend: &'a mut dyn Applicator,
    pub flags: ExtractFlags,
    pub root: DentryId,
    pub target: String,
    pub realtarget: Option<String>,
    pub opts: BackendOptions,
    pub caps: VolumeCapabilities,
    pub root_dentry_is_special: bool,
    pub progress: &'a mut Progress<'p>,
    pub dentry_scratch: Vec<DentryScratch>,
    pub inode_scratch: Vec<InodeScratch>,
    pub stream_scratch: Vec<StreamScratch>,
    /// Distinct streams to read, in reference-discovery order until
    /// sequential extraction sorts by archive offset.
    pub stream_list: Vec<StreamId>,
    pub num_streams_remaining: usize,
    pub invalid_seq: u64,
    pub required: features::FeatureTally,
}

impl ApplyContext<'_, '_> {
    pub fn dentry_scratch(&self, id: DentryId) -> &DentryScratch {
        &self.dentry_scratch[id.index()]
    }

    pub fn dentry_scratch_mut(&mut self, id: DentryId) -> &mut DentryScratch {
        &mut self.dentry_scratch[id.index()]
    }

    pub fn inode_scratch_of(&self, dentry: DentryId) -> &InodeScratch {
        &self.inode_scratch[self.image.dentry(dentry).inode.index()]
    }

    /// Resolved unnamed stream of a dentry's inode, if any.
    pub fn unnamed_stream(&self, dentry: DentryId) -> Option<StreamId> {
        self.inode_scratch_of(dentry).streams.first().copied().flatten()
    }

    /// Resolved stream of the `ads_index`-th ADS entry.
    pub fn ads_stream(&self, dentry: DentryId, ads_index: usize) -> Option<StreamId> {
        self.inode_scratch_of(dentry)
            .streams
            .get(1 + ads_index)
            .copied()
            .flatten()
    }

    pub fn can_extract_named_streams(&self) -> bool {
        self.caps.named_data_streams && !self.flags.is_linked()
    }
}

pub(crate) struct TreeParams<'a> {
    pub image: &'a Image,
    pub streams: &'a mut StreamTable,
    pub source: &'a mut dyn WimSource,
    pub backend: &'a mut dyn Applicator,
    pub source_path: &'a str,
    pub target: &'a str,
    /// Validated and resolved flags.
    pub flags: ExtractFlags,
    /// 1-based image index, for progress reporting.
    pub image_index: usize,
    pub image_name: Option<String>,
    /// XML-declared byte estimate, used when extracting from a pipe.
    pub pipe_total_bytes: Option<u64>,
}

/// Extracts one subtree. This is the heart of the engine; every public
/// entry point funnels here.
pub(crate) fn extract_tree(params: TreeParams<'_>, progress: &mut Progress<'_>) -> Result<()> {
    let TreeParams {
        image,
        streams,
        source,
        backend,
        source_path,
        target,
        flags,
        image_index,
        image_name,
        pipe_total_bytes,
    } = params;

    let root = image
        .get_dentry(source_path)
        .ok_or_else(|| Error::PathDoesNotExist(source_path.to_string()))?;

    progress.begin_op(image_index, image_name, target);

    // The applicator probes the actual volume's capabilities here.
    backend.start(target)?;
    let opts = backend.options().clone();
    let caps = *backend.capabilities();

    let mut ctx = ApplyContext {
        dentry_scratch: (0..image.dentry_count()).map(|_| Default::default()).collect(),
        inode_scratch: (0..image.inode_count()).map(|_| Default::default()).collect(),
        stream_scratch: Vec::new(),
        image,
        streams,
        source,
        backend,
        flags,
        root,
        target: target.to_string(),
        realtarget: None,
        opts,
        caps,
        root_dentry_is_special: false,
        progress,
        stream_list: Vec::new(),
        num_streams_remaining: 0,
        invalid_seq: 0,
        required: Default::default(),
    };

    let is_tree = !source_path.is_empty();
    match run_extract(&mut ctx, pipe_total_bytes, is_tree) {
        Ok(()) => ctx.backend.finish(),
        Err(e) => {
            ctx.backend.abort();
            Err(e)
        }
    }
}

fn run_extract(
    ctx: &mut ApplyContext<'_, '_>,
    pipe_total_bytes: Option<u64>,
    is_tree: bool,
) -> Result<()> {
    let image = ctx.image;
    let root = ctx.root;

    ctx.required = features::tally(image, root);
    features::check(&ctx.required, &ctx.caps, ctx.flags, ctx.opts.name)?;

    if ctx.opts.root_directory_is_special {
        ctx.root_dentry_is_special = ctx.backend.target_is_root(&ctx.target);
    }

    path::compute_names(ctx)?;

    index::resolve_streams(ctx)?;
    ctx.stream_scratch
        .resize_with(ctx.streams.len(), Default::default);
    index::build_stream_index(ctx)?;

    if ctx.flags.from_pipe {
        // The exact stream set is unknown until bytes arrive; estimate
        // the total from the XML data.
        ctx.progress.info.total_bytes = pipe_total_bytes.unwrap_or(0);
    }

    if ctx.flags.to_stdout {
        let mut stdout = std::io::stdout().lock();
        return extract::extract_dentry_to_writer(ctx, root, &mut stdout);
    }

    if ctx.flags.sequential && !ctx.flags.from_pipe {
        // Read the archive front to back.
        let streams = &*ctx.streams;
        ctx.stream_list.sort_by_key(|&id| {
            streams
                .get(id)
                .location
                .wim_offset()
                .unwrap_or(u64::MAX)
        });
    }

    if ctx.opts.realpath_works_on_nonexisting_files
        && (ctx.flags.rpfix || ctx.opts.requires_realtarget_in_paths)
    {
        ctx.realtarget = Some(resolve_realtarget(&ctx.target, true)?);
    }

    ctx.progress.emit(if is_tree {
        ProgressMsg::TreeBegin
    } else {
        ProgressMsg::ImageBegin
    });

    // The extraction root is created up front; every other dentry is
    // guaranteed a parent by pre-order.
    if !ctx.root_dentry_is_special {
        if let Some(root_path) = path::build_extraction_path(ctx, root) {
            skeleton::extract_inode(ctx, &root_path, root)?;
        }
    }

    if ctx.realtarget.is_none()
        && ((ctx.flags.rpfix && ctx.required.symlink_reparse_points > 0)
            || ctx.opts.requires_realtarget_in_paths)
    {
        ctx.realtarget = Some(resolve_realtarget(
            &ctx.target,
            ctx.opts.realpath_works_on_nonexisting_files,
        )?);
    }

    if ctx.flags.sequential || ctx.flags.from_pipe {
        // Two passes: full skeleton, then streams in archive order.
        ctx.progress.emit(ProgressMsg::DirStructureBegin);
        image.walk_pre(root, &mut |_, id| skeleton::dentry_extract_skeleton(ctx, id))?;
        ctx.progress.emit(ProgressMsg::DirStructureEnd);
        if ctx.flags.from_pipe {
            extract::extract_streams_from_pipe(ctx)?;
        } else {
            extract::extract_stream_list(ctx)?;
        }
    } else {
        // One pass: create each file and immediately fill it.
        ctx.progress.emit(ProgressMsg::DirStructureBegin);
        image.walk_pre(root, &mut |_, id| skeleton::dentry_extract(ctx, id))?;
        ctx.progress.emit(ProgressMsg::DirStructureEnd);
    }

    ctx.progress.finish_streams();

    // Security and timestamps go last, depth-first, so nothing disturbs
    // them afterwards.
    ctx.progress.emit(ProgressMsg::ApplyTimestamps);
    image.walk_post(root, &mut |_, id| finalize::dentry_extract_final(ctx, id))?;

    ctx.progress.emit(if is_tree {
        ProgressMsg::TreeEnd
    } else {
        ProgressMsg::ImageEnd
    });
    Ok(())
}

/// Absolute, symlink-resolved form of the extraction target.
fn resolve_realtarget(target: &str, works_on_nonexisting: bool) -> Result<String> {
    match fs::canonicalize(target) {
        Ok(p) => Ok(p.to_string_lossy().into_owned()),
        Err(source) if works_on_nonexisting => {
            let path = Path::new(target);
            let file = match path.file_name() {
                Some(f) => f,
                None => {
                    return Err(Error::Stat {
                        path: path.to_owned(),
                        source,
                    });
                }
            };
            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            let base = fs::canonicalize(parent).map_err(|source| Error::Stat {
                path: parent.to_owned(),
                source,
            })?;
            Ok(base.join(file).to_string_lossy().into_owned())
        }
        Err(source) => Err(Error::Stat {
            path: target.into(),
            source,
        }),
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn extract_single_image<'p>(
    image: &Image,
    streams: &mut StreamTable,
    info: &WimInfo,
    image_index: usize,
    source: &mut dyn WimSource,
    backend: &mut dyn Applicator,
    target: &str,
    flags: ExtractFlags,
    header_flags: u32,
    progress: Option<&'p mut ProgressFn<'p>>,
) -> Result<()> {
    flags.validate(target)?;
    let flags = flags.resolve(header_flags);
    let mut progress = Progress::new(progress);
    extract_tree(
        TreeParams {
            image,
            streams,
            source,
            backend,
            source_path: "",
            target,
            flags,
            image_index,
            image_name: info.image_name(image_index).map(String::from),
            pipe_total_bytes: info.image_total_bytes(image_index),
        },
        &mut progress,
    )
}

/// Applies an image — or every image — of `archive` to `target`.
pub fn extract_image<'p>(
    archive: &mut WimArchive,
    source: &mut dyn WimSource,
    image: ImageSelect,
    target: &str,
    flags: ExtractFlags,
    backend: &mut dyn Applicator,
    progress: Option<&'p mut ProgressFn<'p>>,
) -> Result<()> {
    let result = do_extract_image(archive, source, image, target, flags, backend, progress);
    if flags.is_linked() {
        archive.streams.clear_extracted_files();
    }
    result
}

fn do_extract_image<'p>(
    archive: &mut WimArchive,
    source: &mut dyn WimSource,
    image: ImageSelect,
    target: &str,
    flags: ExtractFlags,
    backend: &mut dyn Applicator,
    progress: Option<&'p mut ProgressFn<'p>>,
) -> Result<()> {
    let mut progress = Progress::new(progress);
    let index = match image {
        ImageSelect::Index(n) => n,
        ImageSelect::Name(ref name) => match archive.info.resolve_image(name) {
            Some(ImageSelect::Index(n)) => n,
            Some(ImageSelect::All) => {
                return extract_all_images(archive, source, target, flags, backend, &mut progress);
            }
            _ => {
                return Err(Error::InvalidImage(format!(
                    "\"{name}\" is not a valid image in the WIM"
                )));
            }
        },
        ImageSelect::All => {
            return extract_all_images(archive, source, target, flags, backend, &mut progress);
        }
    };
    extract_image_index(archive, source, index, target, flags, backend, &mut progress)
}

fn extract_image_index(
    archive: &mut WimArchive,
    source: &mut dyn WimSource,
    index: usize,
    target: &str,
    flags: ExtractFlags,
    backend: &mut dyn Applicator,
    progress: &mut Progress<'_>,
) -> Result<()> {
    let WimArchive {
        images,
        streams,
        info,
        header_flags,
    } = archive;
    let image = images
        .get(index.wrapping_sub(1))
        .ok_or_else(|| Error::InvalidImage(format!("image {index} does not exist")))?;

    flags.validate(target)?;
    let flags = flags.resolve(*header_flags);
    extract_tree(
        TreeParams {
            image,
            streams,
            source,
            backend,
            source_path: "",
            target,
            flags,
            image_index: index,
            image_name: info.image_name(index).map(String::from),
            pipe_total_bytes: info.image_total_bytes(index),
        },
        progress,
    )
}

/// Whether an image name can serve as a directory name on the target.
fn image_name_ok_as_dir(name: &str, opts: &BackendOptions) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.chars().any(|c| opts.forbidden_name_chars.contains(&c))
}

fn extract_all_images(
    archive: &mut WimArchive,
    source: &mut dyn WimSource,
    target: &str,
    mut flags: ExtractFlags,
    backend: &mut dyn Applicator,
    progress: &mut Progress<'_>,
) -> Result<()> {
    flags.multi_image = true;

    if flags.ntfs {
        return Err(Error::InvalidParam(
            "cannot extract multiple images in NTFS extraction mode",
        ));
    }

    match fs::metadata(target) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir(target).map_err(|source| Error::MkDir {
                path: target.into(),
                source,
            })?;
        }
        Err(source) => {
            return Err(Error::Stat {
                path: target.into(),
                source,
            });
        }
        Ok(m) if !m.is_dir() => {
            return Err(Error::InvalidParam("extraction target is not a directory"));
        }
        Ok(_) => {}
    }

    let separator = backend.options().path_separator;
    for index in 1..=archive.image_count() {
        let subdir = match archive.info.image_name(index) {
            Some(name) if image_name_ok_as_dir(name, backend.options()) => name.to_string(),
            _ => index.to_string(),
        };
        let image_target = format!("{target}{separator}{subdir}");
        extract_image_index(archive, source, index, &image_target, flags, backend, progress)?;
    }
    Ok(())
}

/// Extracts a list of subtrees from one image, validating the flag set
/// of every command before any work starts.
pub fn extract_files<'p>(
    archive: &mut WimArchive,
    source: &mut dyn WimSource,
    image_index: usize,
    commands: &[ExtractCommand],
    default_flags: ExtractFlags,
    backend: &mut dyn Applicator,
    progress: Option<&'p mut ProgressFn<'p>>,
) -> Result<()> {
    let mut progress = Progress::new(progress);
    let mut resolved = Vec::with_capacity(commands.len());
    let mut found_link = false;
    let mut found_nolink = false;
    for command in commands {
        let flags = command.flags.merge(default_flags);
        flags.validate(&command.target)?;
        let flags = flags.resolve(archive.header_flags);
        if flags.is_linked() {
            found_link = true;
        } else {
            found_nolink = true;
        }
        if found_link && found_nolink {
            return Err(Error::InvalidParam(
                "symlink or hardlink extraction mode must be set on all extraction commands",
            ));
        }
        resolved.push(flags);
    }

    let result = (|| {
        for (command, &flags) in commands.iter().zip(&resolved) {
            let WimArchive {
                images,
                streams,
                info,
                ..
            } = archive;
            let image = images
                .get(image_index.wrapping_sub(1))
                .ok_or_else(|| Error::InvalidImage(format!("image {image_index} does not exist")))?;
            extract_tree(
                TreeParams {
                    image,
                    streams,
                    source: &mut *source,
                    backend: &mut *backend,
                    source_path: &command.source_path,
                    target: &command.target,
                    flags,
                    image_index,
                    image_name: info.image_name(image_index).map(String::from),
                    pipe_total_bytes: info.image_total_bytes(image_index),
                },
                &mut progress,
            )?;
        }
        Ok(())
    })();

    if found_link {
        archive.streams.clear_extracted_files();
    }
    result
}
