//! The asset-staging seam.
//!
//! The conversion engine itself never touches the filesystem or the network.
//! Whenever a pass needs a code asset materialized — a local CDK asset
//! copied into the project, an S3 artifact downloaded and unpacked, inline
//! code written out to a file — it goes through the injected [`AssetStager`].
//! [`ProjectStager`] is the batteries-included implementation that stages
//! everything under `<project>/src/`; hosts and tests can substitute their
//! own.

use std::collections::HashMap;
use std::fs;

use anyhow::{Context as _, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::refs::extract_sub_parts;
use crate::value::{Intrinsic, Value};

/// Account, region and partition used to resolve `Fn::Sub` pseudo-parameters
/// in asset locations. Detection (STS lookups etc.) is the host's business;
/// the engine only consumes the result.
#[derive(Debug, Clone)]
pub struct AwsEnvironment {
    pub account_id: String,
    pub region: String,
    pub partition: String,
}

impl AwsEnvironment {
    pub fn new(account_id: impl Into<String>, region: impl Into<String>) -> Self {
        let region = region.into();
        let partition = infer_partition(&region).to_owned();
        Self {
            account_id: account_id.into(),
            region,
            partition,
        }
    }
}

pub fn infer_partition(region: &str) -> &'static str {
    let lowered = region.to_ascii_lowercase();
    if lowered.starts_with("us-gov") {
        "aws-us-gov"
    } else if lowered.starts_with("cn-") {
        "aws-cn"
    } else {
        "aws"
    }
}

/// Outcome of resolving a CDK `aws:asset:path` against the search roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalAsset {
    /// The asset exists on disk at this path.
    Present(Utf8PathBuf),
    /// No candidate exists; the most plausible location is kept so the
    /// template can still point somewhere meaningful.
    Missing(Utf8PathBuf),
}

/// One asset staged into the project, kept so hosts can retarget paths after
/// the identity normalizer renames logical ids.
#[derive(Debug, Clone)]
pub struct StagedAsset {
    pub logical_id: String,
    pub source: Utf8PathBuf,
    pub staged: Utf8PathBuf,
}

/// Host-provided S3 access. Unpacking zip artifacts lives here too, next to
/// the download it always follows.
pub trait S3Downloader {
    /// Fetch a single object to `dest`.
    fn fetch_object(
        &self,
        bucket: &str,
        key: &str,
        version: Option<&str>,
        dest: &Utf8Path,
    ) -> anyhow::Result<()>;

    /// Fetch a zip artifact and unpack its contents into `dest_dir`.
    fn fetch_unpacked(
        &self,
        bucket: &str,
        key: &str,
        version: Option<&str>,
        dest_dir: &Utf8Path,
    ) -> anyhow::Result<()>;
}

/// The collaborator consumed by conversion passes.
pub trait AssetStager {
    /// Resolve a CDK asset path against the configured search roots.
    fn find_asset(&self, asset_path: &str) -> Option<LocalAsset>;

    /// First existing file among `file_names`, looked up in every search root.
    fn find_named_asset(&self, file_names: &[String]) -> Option<Utf8PathBuf>;

    fn stage_local_path(
        &mut self,
        logical_id: &str,
        source: &Utf8Path,
    ) -> anyhow::Result<Utf8PathBuf>;

    /// Download + unzip a Lambda artifact; returns the staged directory.
    fn stage_s3_code(
        &mut self,
        logical_id: &str,
        bucket: &str,
        key: &str,
        version: Option<&str>,
    ) -> anyhow::Result<Utf8PathBuf>;

    fn stage_file_asset(
        &mut self,
        logical_id: &str,
        source: &Utf8Path,
        file_name: &str,
    ) -> anyhow::Result<Utf8PathBuf>;

    fn stage_s3_file(
        &mut self,
        logical_id: &str,
        bucket: &str,
        key: &str,
        version: Option<&str>,
        file_name: &str,
    ) -> anyhow::Result<Utf8PathBuf>;

    fn stage_inline_text(
        &mut self,
        logical_id: &str,
        contents: &str,
        file_name: &str,
    ) -> anyhow::Result<Utf8PathBuf>;

    /// Resolve a string-valued node to a literal string. `Fn::Sub` templates
    /// are expanded against the AWS environment; `None` when any token stays
    /// unresolved.
    fn resolve_string(&self, value: &Value) -> Option<String>;
}

/// Stages assets under `<project>/<assets_subdir>/` and keeps a manifest.
pub struct ProjectStager {
    asset_dir: Utf8PathBuf,
    search_roots: Vec<Utf8PathBuf>,
    records: Vec<StagedAsset>,
    cache: HashMap<Utf8PathBuf, Utf8PathBuf>,
    downloader: Option<Box<dyn S3Downloader>>,
    aws_env: Option<AwsEnvironment>,
}

impl ProjectStager {
    pub fn new(project_dir: impl AsRef<Utf8Path>) -> Self {
        Self {
            asset_dir: project_dir.as_ref().join("src"),
            search_roots: Vec::new(),
            records: Vec::new(),
            cache: HashMap::new(),
            downloader: None,
            aws_env: None,
        }
    }

    pub fn with_assets_subdir(mut self, subdir: impl AsRef<Utf8Path>) -> Self {
        self.asset_dir = self
            .asset_dir
            .parent()
            .map(|parent| parent.join(subdir.as_ref()))
            .unwrap_or_else(|| subdir.as_ref().to_owned());
        self
    }

    pub fn with_search_roots(mut self, roots: impl IntoIterator<Item = Utf8PathBuf>) -> Self {
        self.search_roots = roots.into_iter().collect();
        self
    }

    pub fn with_downloader(mut self, downloader: Box<dyn S3Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn with_aws_environment(mut self, env: AwsEnvironment) -> Self {
        self.aws_env = Some(env);
        self
    }

    pub fn records(&self) -> &[StagedAsset] {
        &self.records
    }

    /// Retarget staged directories after the identity normalizer renamed
    /// logical ids. The rename map is the only channel carrying this info.
    pub fn apply_rename_map(&mut self, renames: &crate::refs::RenameMap) -> anyhow::Result<()> {
        for record in &mut self.records {
            let Some(new_id) = renames.get(&record.logical_id) else {
                continue;
            };
            if new_id == &record.logical_id {
                continue;
            }
            let Some(parent) = record.staged.parent() else {
                continue;
            };
            let target = parent.join(new_id);
            if target.exists() {
                fs::remove_dir_all(&target)
                    .with_context(|| format!("replacing staged asset at {target}"))?;
            }
            fs::rename(&record.staged, &target)
                .with_context(|| format!("renaming staged asset to {target}"))?;
            record.logical_id = new_id.clone();
            record.staged = target;
        }
        Ok(())
    }

    fn allocate_destination(&self, base_name: &str) -> Utf8PathBuf {
        let base_name = if base_name.is_empty() { "asset" } else { base_name };
        let mut candidate = self.asset_dir.join(base_name);
        let mut counter = 2usize;
        while candidate.exists() {
            candidate = self.asset_dir.join(format!("{base_name}-{counter}"));
            counter += 1;
        }
        candidate
    }

    fn allocate_directory(&self, logical_id: &str) -> anyhow::Result<Utf8PathBuf> {
        let target = self.asset_dir.join(logical_id);
        if target.exists() {
            if target.is_dir() {
                fs::remove_dir_all(&target)?;
            } else {
                fs::remove_file(&target)?;
            }
        }
        fs::create_dir_all(&target)?;
        Ok(target)
    }

    fn record(&mut self, logical_id: &str, source: Utf8PathBuf, staged: Utf8PathBuf) {
        self.records.push(StagedAsset {
            logical_id: logical_id.to_owned(),
            source,
            staged,
        });
    }
}

impl AssetStager for ProjectStager {
    fn find_asset(&self, asset_path: &str) -> Option<LocalAsset> {
        let candidate = Utf8PathBuf::from(asset_path);
        let mut candidates = Vec::new();
        if candidate.is_absolute() {
            candidates.push(candidate);
        } else {
            for root in &self.search_roots {
                candidates.push(root.join(&candidate));
            }
            candidates.push(candidate);
        }
        for entry in &candidates {
            if entry.exists() {
                let resolved = entry.canonicalize_utf8().unwrap_or_else(|_| entry.clone());
                return Some(LocalAsset::Present(resolved));
            }
        }
        candidates.into_iter().next().map(LocalAsset::Missing)
    }

    fn find_named_asset(&self, file_names: &[String]) -> Option<Utf8PathBuf> {
        for root in &self.search_roots {
            for name in file_names {
                let candidate = root.join(name);
                if candidate.exists() {
                    return Some(candidate);
                }
            }
        }
        None
    }

    fn stage_local_path(
        &mut self,
        logical_id: &str,
        source: &Utf8Path,
    ) -> anyhow::Result<Utf8PathBuf> {
        let resolved = source
            .canonicalize_utf8()
            .unwrap_or_else(|_| source.to_owned());
        if let Some(staged) = self.cache.get(&resolved) {
            let staged = staged.clone();
            self.record(logical_id, resolved, staged.clone());
            return Ok(staged);
        }
        let file_name = resolved.file_name().unwrap_or("asset");
        let staged = self.allocate_destination(file_name);
        copy_recursively(&resolved, &staged)
            .with_context(|| format!("copying {resolved} into {staged}"))?;
        debug!(%logical_id, source = %resolved, target = %staged, "staged local asset");
        self.cache.insert(resolved.clone(), staged.clone());
        self.record(logical_id, resolved, staged.clone());
        Ok(staged)
    }

    fn stage_s3_code(
        &mut self,
        logical_id: &str,
        bucket: &str,
        key: &str,
        version: Option<&str>,
    ) -> anyhow::Result<Utf8PathBuf> {
        let downloader = self
            .downloader
            .as_ref()
            .ok_or_else(|| anyhow!("no S3 downloader configured"))?;
        let target = self.allocate_directory(logical_id)?;
        downloader.fetch_unpacked(bucket, key, version, &target)?;
        debug!(%logical_id, bucket, key, target = %target, "staged S3 artifact");
        self.record(
            logical_id,
            Utf8PathBuf::from(format_s3_uri(bucket, key, version)),
            target.clone(),
        );
        Ok(target)
    }

    fn stage_file_asset(
        &mut self,
        logical_id: &str,
        source: &Utf8Path,
        file_name: &str,
    ) -> anyhow::Result<Utf8PathBuf> {
        let resolved = source
            .canonicalize_utf8()
            .unwrap_or_else(|_| source.to_owned());
        let target = self.allocate_directory(logical_id)?.join(file_name);
        fs::copy(&resolved, &target).with_context(|| format!("copying {resolved} to {target}"))?;
        self.record(logical_id, resolved, target.clone());
        Ok(target)
    }

    fn stage_s3_file(
        &mut self,
        logical_id: &str,
        bucket: &str,
        key: &str,
        version: Option<&str>,
        file_name: &str,
    ) -> anyhow::Result<Utf8PathBuf> {
        let downloader = self
            .downloader
            .as_ref()
            .ok_or_else(|| anyhow!("no S3 downloader configured"))?;
        let target = self.allocate_directory(logical_id)?.join(file_name);
        downloader.fetch_object(bucket, key, version, &target)?;
        self.record(
            logical_id,
            Utf8PathBuf::from(format_s3_uri(bucket, key, version)),
            target.clone(),
        );
        Ok(target)
    }

    fn stage_inline_text(
        &mut self,
        logical_id: &str,
        contents: &str,
        file_name: &str,
    ) -> anyhow::Result<Utf8PathBuf> {
        let payload = if contents.ends_with('\n') {
            contents.to_owned()
        } else {
            format!("{contents}\n")
        };
        let target = self.allocate_directory(logical_id)?.join(file_name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, payload).with_context(|| format!("writing inline asset {target}"))?;
        self.record(
            logical_id,
            Utf8PathBuf::from(format!("<inline:{logical_id}>")),
            target.clone(),
        );
        Ok(target)
    }

    fn resolve_string(&self, value: &Value) -> Option<String> {
        resolve_with_env(value, self.aws_env.as_ref())
    }
}

fn resolve_with_env(value: &Value, env: Option<&AwsEnvironment>) -> Option<String> {
    let payload = match value {
        Value::String(s) => return Some(s.clone()),
        Value::Intrinsic(tag) => match &**tag {
            Intrinsic::Sub(payload) => payload,
            _ => return None,
        },
        Value::Map(map) if map.len() == 1 => map.get("Fn::Sub")?,
        _ => return None,
    };
    let (template, mapping) = extract_sub_parts(payload)?;
    let env = env?;
    let mut result = template.to_owned();
    let mut replace = |token: &str, with: &str| {
        result = result.replace(&format!("${{{token}}}"), with);
    };
    replace("AWS::AccountId", &env.account_id);
    replace("AWS::Region", &env.region);
    replace("AWS::Partition", &env.partition);
    if let Some(mapping) = mapping {
        for (name, raw) in mapping {
            let resolved = resolve_with_env(raw, Some(env))?;
            result = result.replace(&format!("${{{name}}}"), &resolved);
        }
    }
    if result.contains("${") {
        return None;
    }
    Some(result)
}

fn copy_recursively(source: &Utf8Path, dest: &Utf8Path) -> anyhow::Result<()> {
    if source.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in source.read_dir_utf8()? {
            let entry = entry?;
            copy_recursively(entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, dest)?;
    }
    Ok(())
}

/// Render a staged path for `CodeUri`, relative to the project when possible.
pub fn format_code_uri(path: &Utf8Path, relative_to: Option<&Utf8Path>) -> String {
    if let Some(base) = relative_to
        && let Ok(relative) = path.strip_prefix(base)
    {
        return relative.to_string();
    }
    path.to_string()
}

pub fn format_s3_uri(bucket: &str, key: &str, version: Option<&str>) -> String {
    match version {
        Some(version) => format!("s3://{bucket}/{key}?versionId={version}"),
        None => format!("s3://{bucket}/{key}"),
    }
}

/// Normalize inline code for a literal block: strip blank edge lines, remove
/// the common leading indent and expand tabs to two spaces.
pub fn prepare_inline_code(value: &str) -> String {
    let decoded = decode_escaped(value);
    let mut lines: Vec<&str> = decoded.split('\n').collect();
    while lines.first().is_some_and(|line| line.trim().is_empty()) {
        lines.remove(0);
    }
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }
    if lines.is_empty() {
        return String::new();
    }
    let indent = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start_matches(' ').len())
        .min()
        .unwrap_or(0);
    lines
        .iter()
        .map(|line| if line.len() >= indent { &line[indent..] } else { line })
        .map(|line| expand_tabs(line, 2))
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_escaped(value: &str) -> String {
    value
        .replace("\r\n", "\n")
        .replace("\\r\\n", "\n")
        .replace("\\n", "\n")
        .replace("\\t", "\t")
}

fn expand_tabs(line: &str, width: usize) -> String {
    let mut out = String::with_capacity(line.len());
    let mut column = 0usize;
    for ch in line.chars() {
        if ch == '\t' {
            let spaces = width - (column % width);
            out.extend(std::iter::repeat_n(' ', spaces));
            column += spaces;
        } else {
            out.push(ch);
            column += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_follows_region() {
        assert_eq!(infer_partition("eu-west-1"), "aws");
        assert_eq!(infer_partition("us-gov-west-1"), "aws-us-gov");
        assert_eq!(infer_partition("cn-north-1"), "aws-cn");
    }

    #[test]
    fn inline_code_is_dedented_and_tab_expanded() {
        let code = "\n    def handler(event, context):\n    \treturn event\n\n";
        assert_eq!(
            prepare_inline_code(code),
            "def handler(event, context):\n  return event"
        );
    }

    #[test]
    fn inline_code_decodes_escaped_newlines() {
        assert_eq!(prepare_inline_code("a\\nb"), "a\nb");
    }

    #[test]
    fn resolve_string_expands_pseudo_parameters() {
        let stager = ProjectStager::new("project")
            .with_aws_environment(AwsEnvironment::new("123456789012", "eu-central-1"));
        let value = Value::sub("cdk-assets-${AWS::AccountId}-${AWS::Region}");
        assert_eq!(
            stager.resolve_string(&value).as_deref(),
            Some("cdk-assets-123456789012-eu-central-1")
        );
    }

    #[test]
    fn resolve_string_uses_substitution_map() {
        let stager = ProjectStager::new("project")
            .with_aws_environment(AwsEnvironment::new("123456789012", "eu-central-1"));
        let value = Value::from_json(serde_json::json!({
            "Fn::Sub": ["${Prefix}/code.zip", { "Prefix": "assets" }],
        }));
        assert_eq!(stager.resolve_string(&value).as_deref(), Some("assets/code.zip"));
    }

    #[test]
    fn resolve_string_fails_on_unresolved_tokens() {
        let stager = ProjectStager::new("project")
            .with_aws_environment(AwsEnvironment::new("123456789012", "eu-central-1"));
        let value = Value::sub("bucket-${SomeParameter}");
        assert_eq!(stager.resolve_string(&value), None);
    }

    #[test]
    fn code_uri_is_relative_when_possible() {
        assert_eq!(
            format_code_uri(Utf8Path::new("/work/app/src/Fn"), Some(Utf8Path::new("/work/app"))),
            "src/Fn"
        );
        assert_eq!(
            format_code_uri(Utf8Path::new("/elsewhere/src/Fn"), Some(Utf8Path::new("/work/app"))),
            "/elsewhere/src/Fn"
        );
    }

    #[test]
    fn staged_inline_text_lands_in_asset_dir() {
        let base = Utf8PathBuf::from(std::env::temp_dir().to_str().expect("utf-8 tmpdir"))
            .join(format!("samara-stager-{}", std::process::id()));
        let mut stager = ProjectStager::new(&base);
        let staged = stager
            .stage_inline_text("Handler", "print('hi')", "index.py")
            .unwrap();
        assert_eq!(staged, base.join("src").join("Handler").join("index.py"));
        assert_eq!(fs::read_to_string(&staged).unwrap(), "print('hi')\n");
        assert_eq!(stager.records().len(), 1);
        fs::remove_dir_all(&base).unwrap();
    }
}
