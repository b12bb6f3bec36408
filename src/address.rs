//! Address lists, districts and the per-address job paths.

use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// District name used for addresses listed before any `[District]` header.
pub const DEFAULT_DISTRICT: &str = "default";

const TEMPLATE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

fn separator_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s/\\]").expect("valid regex"))
}

fn disallowed_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\p{Latin}0-9_#-]").expect("valid regex"))
}

fn header_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[\s*(.+?)\s*\]$").expect("valid regex"))
}

/// Derives the capture/project file stem from a free-text address.
///
/// Whitespace and path separators become `_`; punctuation and non-Latin
/// characters are dropped.
///
/// ```text
/// "110 N La Brea Ave, Inglewood, CA 90301" -> "110_N_La_Brea_Ave_Inglewood_CA_90301"
/// ```
pub fn sanitize_filename(address: &str) -> String {
    let separated = separator_pattern().replace_all(address.trim(), "_");
    disallowed_pattern().replace_all(&separated, "").into_owned()
}

/// A named batch of addresses sharing one template directory.
#[derive(Debug, Clone, PartialEq)]
pub struct District {
    pub name: String,
    pub addresses: Vec<String>,
}

fn district_index(districts: &mut Vec<District>, name: &str) -> usize {
    // Reopening a district appends to it
    if let Some(idx) = districts.iter().position(|d| d.name == name) {
        return idx;
    }
    districts.push(District {
        name: name.to_string(),
        addresses: Vec::new(),
    });
    districts.len() - 1
}

/// Parses an address file.
///
/// `[Name]` lines open a district; blank lines and `#` comments are skipped.
pub fn parse_address_list(text: &str) -> Vec<District> {
    let mut districts: Vec<District> = Vec::new();
    let mut current: Option<usize> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(caps) = header_pattern().captures(line) {
            current = Some(district_index(&mut districts, &caps[1]));
            continue;
        }

        let idx = *current.get_or_insert_with(|| district_index(&mut districts, DEFAULT_DISTRICT));
        districts[idx].addresses.push(line.to_string());
    }

    districts.retain(|d| !d.addresses.is_empty());
    districts
}

pub fn load_address_list(path: &Path) -> Result<Vec<District>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read address file {}", path.display()))?;
    Ok(parse_address_list(&text))
}

/// Directories the job paths are derived from.
#[derive(Debug, Clone)]
pub struct JobLayout {
    pub rdc_dir: PathBuf,
    pub project_dir: PathBuf,
    pub template_dir: Option<PathBuf>,
    pub fallback_template: Option<PathBuf>,
}

/// One address to process, with every path the pipeline touches.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub district: String,
    /// 1-based position within the district
    pub index: usize,
    pub address: String,
    pub filename: String,
    pub capture_path: PathBuf,
    pub project_path: PathBuf,
    pub template_path: Option<PathBuf>,
    /// Why the address cannot be processed at all
    pub rejected: Option<String>,
}

impl JobLayout {
    /// Finds `<template_dir>/<district>/<index>.{png,jpg,jpeg}`, else the fallback template.
    pub fn template_for(&self, district: &str, index: usize) -> Option<PathBuf> {
        if let Some(dir) = &self.template_dir {
            let district_dir = dir.join(district);
            for ext in TEMPLATE_EXTENSIONS {
                let candidate = district_dir.join(format!("{}.{}", index, ext));
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        self.fallback_template.clone()
    }

    pub fn job(&self, district: &str, index: usize, address: &str) -> Job {
        let filename = sanitize_filename(address);
        let rejected = (!filename.chars().any(char::is_alphanumeric)).then(|| {
            format!("\"{}\" has no Latin letters or digits to name its files", address)
        });
        let mut job = Job {
            district: district.to_string(),
            index,
            address: address.to_string(),
            filename: String::new(),
            capture_path: PathBuf::new(),
            project_path: PathBuf::new(),
            template_path: self.template_for(district, index),
            rejected,
        };
        self.rename(&mut job, filename);
        job
    }

    fn rename(&self, job: &mut Job, filename: String) {
        job.capture_path = self.rdc_dir.join(format!("{}.rdc", filename));
        job.project_path = self
            .project_dir
            .join(&job.district)
            .join(format!("{}.blend", filename));
        job.filename = filename;
    }

    /// Expands districts into jobs, optionally keeping only the named districts.
    ///
    /// Captures share one directory, so an address whose file name is already
    /// taken in this run gets a `_<index>` suffix.
    pub fn jobs(&self, districts: &[District], only: &[String]) -> Vec<Job> {
        let mut jobs: Vec<Job> = districts
            .iter()
            .filter(|d| only.is_empty() || only.iter().any(|name| name == &d.name))
            .flat_map(|d| {
                d.addresses
                    .iter()
                    .enumerate()
                    .map(move |(i, address)| self.job(&d.name, i + 1, address))
            })
            .collect();

        // File names compare case-insensitively on Windows
        let mut taken: HashSet<String> = HashSet::new();
        for job in jobs.iter_mut().filter(|j| j.rejected.is_none()) {
            if taken.insert(job.filename.to_lowercase()) {
                continue;
            }
            let mut n = job.index;
            let unique = loop {
                let candidate = format!("{}_{}", job.filename, n);
                if !taken.contains(&candidate.to_lowercase()) {
                    break candidate;
                }
                n += 1;
            };
            tracing::warn!(
                "\"{}\" shares the file name {} with an earlier address, using {}",
                job.address,
                job.filename,
                unique
            );
            taken.insert(unique.to_lowercase());
            self.rename(job, unique);
        }
        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sanitize_known_address() {
        assert_eq!(
            sanitize_filename("110 N La Brea Ave, Inglewood, CA 90301"),
            "110_N_La_Brea_Ave_Inglewood_CA_90301"
        );
    }

    #[test]
    fn test_sanitize_strips_separators_and_punctuation() {
        assert_eq!(sanitize_filename(r"1/2 Main St.\Apt|3"), "1_2_Main_St_Apt3");
        assert_eq!(sanitize_filename("Unit #4-B"), "Unit_#4-B");
    }

    #[test]
    fn test_sanitize_drops_non_latin_keeps_accents() {
        assert_eq!(sanitize_filename("北京 Rue de l'Église"), "_Rue_de_lÉglise");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let samples = [
            "110 N La Brea Ave, Inglewood, CA 90301",
            "  上海市 Nanjing Rd. 100  ",
            "a\\b/c d\te",
            "Straße 5, München",
        ];
        for s in samples {
            let once = sanitize_filename(s);
            assert_eq!(sanitize_filename(&once), once);
            assert!(!once.contains([',', '.', '|', ' ', '/', '\\']));
        }
    }

    #[test]
    fn test_parse_districts() {
        let text = "\
# addresses for the demo
1 Loose St

[Inglewood]
110 N La Brea Ave, Inglewood, CA 90301
1 Main St

[Empty]
[Pasadena]
200 Colorado Blvd
";
        let districts = parse_address_list(text);
        assert_eq!(districts.len(), 3);
        assert_eq!(districts[0].name, DEFAULT_DISTRICT);
        assert_eq!(districts[0].addresses, vec!["1 Loose St"]);
        assert_eq!(districts[1].name, "Inglewood");
        assert_eq!(districts[1].addresses.len(), 2);
        assert_eq!(districts[2].name, "Pasadena");
    }

    #[test]
    fn test_reopened_district_appends() {
        let districts = parse_address_list("[A]\n1 X\n[B]\n2 Y\n[A]\n3 Z\n");
        assert_eq!(districts.len(), 2);
        let a = districts.iter().find(|d| d.name == "A").unwrap();
        assert_eq!(a.addresses, vec!["1 X", "3 Z"]);
    }

    #[test]
    fn test_job_paths_and_template_lookup() {
        let dir = tempdir().unwrap();
        let templates = dir.path().join("templates");
        std::fs::create_dir_all(templates.join("Inglewood")).unwrap();
        std::fs::write(templates.join("Inglewood").join("2.jpg"), b"x").unwrap();
        let fallback = dir.path().join("fallback.png");

        let layout = JobLayout {
            rdc_dir: dir.path().join("rdc"),
            project_dir: dir.path().join("projects"),
            template_dir: Some(templates.clone()),
            fallback_template: Some(fallback.clone()),
        };

        let districts = vec![District {
            name: "Inglewood".to_string(),
            addresses: vec!["1 Main St".to_string(), "2 Oak Ave".to_string()],
        }];
        let jobs = layout.jobs(&districts, &[]);
        assert_eq!(jobs.len(), 2);

        assert_eq!(jobs[0].index, 1);
        assert_eq!(jobs[0].capture_path, dir.path().join("rdc").join("1_Main_St.rdc"));
        assert_eq!(
            jobs[0].project_path,
            dir.path().join("projects").join("Inglewood").join("1_Main_St.blend")
        );
        assert_eq!(jobs[0].template_path, Some(fallback));
        assert_eq!(
            jobs[1].template_path,
            Some(templates.join("Inglewood").join("2.jpg"))
        );
    }

    #[test]
    fn test_jobs_district_filter() {
        let layout = JobLayout {
            rdc_dir: PathBuf::from("rdc"),
            project_dir: PathBuf::from("projects"),
            template_dir: None,
            fallback_template: None,
        };
        let districts = parse_address_list("[A]\n1 X\n[B]\n2 Y\n");
        let jobs = layout.jobs(&districts, &["B".to_string()]);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].district, "B");
    }

    fn plain_layout() -> JobLayout {
        JobLayout {
            rdc_dir: PathBuf::from("rdc"),
            project_dir: PathBuf::from("projects"),
            template_dir: None,
            fallback_template: None,
        }
    }

    #[test]
    fn test_address_without_usable_characters_is_rejected() {
        let layout = plain_layout();
        let districts = parse_address_list("[Beijing]\n北京市朝阳区\n北京 上海\n1 Main St\n");
        let jobs = layout.jobs(&districts, &[]);
        assert_eq!(jobs.len(), 3);
        for job in &jobs[..2] {
            let reason = job.rejected.as_deref().unwrap();
            assert!(reason.contains(&job.address), "{}", reason);
        }
        assert!(jobs[2].rejected.is_none());
        assert_eq!(jobs[2].filename, "1_Main_St");
    }

    #[test]
    fn test_colliding_filenames_get_index_suffix() {
        let layout = plain_layout();
        let districts = parse_address_list("[A]\n88号\n路88\n88 号\n[B]\n88\n");
        let jobs = layout.jobs(&districts, &[]);
        let names: Vec<&str> = jobs.iter().map(|j| j.filename.as_str()).collect();
        assert_eq!(names, vec!["88", "88_2", "88_", "88_1"]);

        let captures: HashSet<&PathBuf> = jobs.iter().map(|j| &j.capture_path).collect();
        assert_eq!(captures.len(), jobs.len());
        assert_eq!(jobs[1].capture_path, PathBuf::from("rdc").join("88_2.rdc"));
        assert_eq!(
            jobs[1].project_path,
            PathBuf::from("projects").join("A").join("88_2.blend")
        );
    }
}
