use std::collections::HashSet;
use std::path::Path;

use anyhow::Context as _;

use crate::formats::ClassCandidate;

/// The class manifest (`classes.jsonl`): one [`ClassCandidate`] per line.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    candidates: Vec<ClassCandidate>,
}

impl Manifest {
    pub fn from_candidates(candidates: Vec<ClassCandidate>) -> Self {
        Self { candidates }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read manifest: {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("parse manifest: {}", path.display()))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let mut candidates = Vec::new();
        let mut seen = HashSet::new();
        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut candidate: ClassCandidate = serde_json::from_str(line)
                .with_context(|| format!("manifest line {}", idx + 1))?;
            candidate.course_name = candidate.course_name.trim().to_owned();
            candidate.class_id = candidate.class_id.trim().to_owned();
            if candidate.course_name.is_empty() || candidate.class_id.is_empty() {
                anyhow::bail!("manifest line {}: course_name and class_id are required", idx + 1);
            }
            if !seen.insert((candidate.course_name.clone(), candidate.class_id.clone())) {
                tracing::warn!(
                    course = %candidate.course_name,
                    class_id = %candidate.class_id,
                    "duplicate manifest entry ignored"
                );
                continue;
            }
            candidates.push(candidate);
        }
        Ok(Self { candidates })
    }

    pub fn candidates(&self) -> &[ClassCandidate] {
        &self.candidates
    }

    /// Course names in order of first appearance.
    pub fn courses(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.candidates
            .iter()
            .filter(|c| seen.insert(c.course_name.as_str()))
            .map(|c| c.course_name.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}
