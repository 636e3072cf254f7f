use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::{load_environment, EnvironmentConfig};
use crate::error::PipelineError;
use crate::output;
use crate::paths::templates_dir;
use crate::utils::{redact_value, write_if_changed};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateTarget {
    pub template: &'static str,
    pub output: &'static str,
    pub remote: &'static str,
}

pub const TEMPLATE_TARGETS: [TemplateTarget; 4] = [
    TemplateTarget {
        template: "tracker.toml.tpl",
        output: "application/storage/tracker/etc/tracker.toml",
        remote: "tracker/etc/tracker.toml",
    },
    TemplateTarget {
        template: "prometheus.yml.tpl",
        output: "application/storage/prometheus/etc/prometheus.yml",
        remote: "prometheus/etc/prometheus.yml",
    },
    TemplateTarget {
        template: "nginx.conf.tpl",
        output: "application/storage/proxy/etc/nginx-conf/nginx.conf",
        remote: "proxy/etc/nginx-conf/nginx.conf",
    },
    TemplateTarget {
        template: "docker-compose.env.tpl",
        output: "application/.env",
        remote: "compose/.env",
    },
];

#[derive(Debug, Clone)]
pub struct RenderedFile {
    pub target: TemplateTarget,
    pub path: PathBuf,
    pub changed: bool,
    pub unset_vars: Vec<String>,
}

/// Replaces every `${NAME}` with the value returned by `lookup`, or with an
/// empty string when the name is unknown. `$name` without braces is kept
/// verbatim so nginx variables survive.
pub fn substitute<'a, F>(template: &str, lookup: F) -> (String, Vec<String>)
where
    F: Fn(&str) -> Option<&'a str>,
{
    let mut out = String::with_capacity(template.len());
    let mut unset = BTreeSet::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if is_variable_name(&after[..end]) => {
                let name = &after[..end];
                match lookup(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        unset.insert(name.to_string());
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    (out, unset.into_iter().collect())
}

fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first == '_' || first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|ch| ch == '_' || ch.is_ascii_alphanumeric())
}

pub fn render_templates(project: &Path, config: &EnvironmentConfig) -> Result<Vec<RenderedFile>> {
    let dir = templates_dir(project);
    if !dir.is_dir() {
        return Err(PipelineError::ConfigNotFound { path: dir }.into());
    }
    warn_unknown_templates(&dir);

    let mut rendered = Vec::new();
    for target in TEMPLATE_TARGETS {
        let template_path = dir.join(target.template);
        if !template_path.is_file() {
            return Err(PipelineError::ConfigNotFound {
                path: template_path,
            }
            .into());
        }
        let template = fs::read_to_string(&template_path)
            .with_context(|| format!("Failed to read template {}", template_path.display()))?;
        let (contents, unset_vars) = substitute(&template, |name| config.get(name));
        for name in &unset_vars {
            tracing::warn!(template = target.template, variable = %name, "unset variable rendered as empty");
        }

        let output = project.join(target.output);
        if output.extension().and_then(OsStr::to_str) == Some("toml") {
            toml::from_str::<toml::Table>(&contents).map_err(|err| PipelineError::ConfigInvalid {
                key: target.template.to_string(),
                reason: format!("renders to invalid TOML: {err}"),
            })?;
        }
        let changed = write_if_changed(&output, contents.as_bytes())?;
        rendered.push(RenderedFile {
            target,
            path: output,
            changed,
            unset_vars,
        });
    }
    Ok(rendered)
}

fn warn_unknown_templates(dir: &Path) {
    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(OsStr::to_str) != Some("tpl") {
            continue;
        }
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        let known = TEMPLATE_TARGETS
            .iter()
            .any(|target| Path::new(target.template) == rel);
        if !known {
            tracing::warn!(template = %rel.display(), "template has no designated output; skipped");
        }
    }
}

pub fn configure_env(project: &Path, environment: &str, verbose: bool) -> Result<EnvironmentConfig> {
    output::header(&format!("Configuring environment {environment}"));
    let config = load_environment(project, environment)?;
    output::success(&format!(
        "Loaded {} ({} keys, provider {}, transfer {})",
        config.source.display(),
        config.values().len(),
        config.provider,
        config.transfer_mode
    ));
    if verbose {
        for (key, value) in config.values() {
            output::info(&format!("{key}={}", redact_value(key, value)));
        }
    }

    let rendered = render_templates(project, &config)?;
    for file in &rendered {
        let rel = file.path.strip_prefix(project).unwrap_or(&file.path);
        let state = if file.changed { "written" } else { "unchanged" };
        output::info(&format!("{} -> {} ({state})", file.target.template, rel.display()));
        if !file.unset_vars.is_empty() {
            output::warning(&format!(
                "{}: unset variables rendered empty: {}",
                file.target.template,
                file.unset_vars.join(", ")
            ));
        }
    }
    output::success(&format!("Configuration for {environment} rendered"));
    Ok(config)
}

pub fn rendered_outputs(project: &Path) -> Result<Vec<(PathBuf, &'static str)>> {
    let mut outputs = Vec::new();
    for target in TEMPLATE_TARGETS {
        let path = project.join(target.output);
        if !path.is_file() {
            return Err(anyhow::Error::new(PipelineError::ConfigNotFound { path })
                .context("rendered configuration missing; run configure-env first"));
        }
        outputs.push((path, target.remote));
    }
    Ok(outputs)
}
