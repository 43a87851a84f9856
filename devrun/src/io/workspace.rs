//! Per-run sandbox directories.
//!
//! Each run owns one directory under the configured sandbox root while its
//! loop holds the registry claim. The path is persisted on the run so a
//! restarted process reuses the same directory instead of losing work.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::core::path::{InvalidWorkspacePath, sanitize_workspace_path, slugify};
use crate::core::types::{DevelopmentRun, GeneratedFile, PlansSnapshot};

/// Directories never scanned or committed.
pub const EXCLUDED_DIRS: &[&str] = &["node_modules", ".next", "dist", "build", "coverage", ".git"];

const README_TEMPLATE: &str = include_str!("templates/readme.md");
const PAGE_TEMPLATE: &str = include_str!("templates/page.tsx");
const MODEL_TEMPLATE: &str = include_str!("templates/model.ts");
const PACKAGE_JSON_TEMPLATE: &str = include_str!("templates/package.json");

const GITIGNORE: &str = "node_modules/\n.next/\ndist/\nbuild/\ncoverage/\n.env\n.env.local\n";

const TSCONFIG: &str = r#"{
  "compilerOptions": {
    "target": "ES2020",
    "lib": ["dom", "dom.iterable", "esnext"],
    "allowJs": false,
    "skipLibCheck": true,
    "strict": true,
    "noEmit": true,
    "esModuleInterop": true,
    "module": "esnext",
    "moduleResolution": "bundler",
    "resolveJsonModule": true,
    "isolatedModules": true,
    "jsx": "preserve",
    "incremental": true,
    "baseUrl": ".",
    "paths": { "@/*": ["./src/*"] },
    "plugins": [{ "name": "next" }]
  },
  "include": ["next-env.d.ts", "**/*.ts", "**/*.tsx"],
  "exclude": ["node_modules"]
}
"#;

const NEXT_ENV: &str = "/// <reference types=\"next\" />\n/// <reference types=\"next/image-types/global\" />\n";

const ROOT_LAYOUT: &str = r#"export const metadata = { title: "App" };

export default function RootLayout({ children }: { children: React.ReactNode }) {
  return (
    <html lang="en">
      <body>{children}</body>
    </html>
  );
}
"#;

const HOME_PAGE: &str = r#"export default function HomePage() {
  return (
    <main>
      <h1>Welcome</h1>
    </main>
  );
}
"#;

const VITEST_CONFIG: &str = r#"import { defineConfig } from "vitest/config";

export default defineConfig({
  test: {
    include: ["src/**/*.test.ts", "src/**/*.test.tsx"],
    passWithNoTests: true,
  },
});
"#;

/// What [`SandboxManager::bootstrap`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapOutcome {
    /// The manifest existed; nothing was written.
    pub already_prepared: bool,
    /// The minimal skeleton was needed after templating.
    pub used_fallback: bool,
    pub written: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SandboxManager {
    root: PathBuf,
    manifest: String,
}

impl SandboxManager {
    pub fn new(root: impl Into<PathBuf>, manifest: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            manifest: manifest.into(),
        }
    }

    /// Return the run's sandbox, allocating and recording it on first use.
    ///
    /// The caller persists `run` so a restart finds the same path.
    #[instrument(skip_all, fields(run_id = %run.id))]
    pub fn ensure_sandbox(&self, run: &mut DevelopmentRun) -> Result<PathBuf> {
        let path = match &run.worker_sandbox_path {
            Some(existing) => PathBuf::from(existing),
            None => self.root.join(&run.id),
        };
        fs::create_dir_all(&path).with_context(|| format!("create sandbox {}", path.display()))?;
        if run.worker_sandbox_path.is_none() {
            debug!(path = %path.display(), "sandbox allocated");
            run.worker_sandbox_path = Some(path.to_string_lossy().into_owned());
        }
        Ok(path)
    }

    pub fn has_manifest(&self, sandbox: &Path) -> bool {
        sandbox.join(&self.manifest).is_file()
    }

    /// Render the base project from the plan snapshot; fall back to a
    /// guaranteed-buildable skeleton if no manifest results.
    #[instrument(skip_all, fields(sandbox = %sandbox.display()))]
    pub fn bootstrap(&self, sandbox: &Path, plans: &PlansSnapshot) -> Result<BootstrapOutcome> {
        if self.has_manifest(sandbox) {
            return Ok(BootstrapOutcome {
                already_prepared: true,
                used_fallback: false,
                written: Vec::new(),
            });
        }

        let templated = render_base_templates(plans)?;
        let mut written = self.write_files(sandbox, &templated)?;

        let mut used_fallback = false;
        if !self.has_manifest(sandbox) {
            let skeleton = fallback_skeleton(plans)?;
            let missing: Vec<GeneratedFile> = skeleton
                .into_iter()
                .filter(|file| !sandbox.join(&file.path).exists())
                .collect();
            written.extend(self.write_files(sandbox, &missing)?);
            used_fallback = true;
        }
        if !self.has_manifest(sandbox) {
            return Err(anyhow!(
                "bootstrap did not produce {} in {}",
                self.manifest,
                sandbox.display()
            ));
        }
        info!(files = written.len(), used_fallback, "workspace bootstrapped");
        Ok(BootstrapOutcome {
            already_prepared: false,
            used_fallback,
            written,
        })
    }

    /// Write files under `sandbox`; returns the sanitized paths written.
    pub fn write_files(&self, sandbox: &Path, files: &[GeneratedFile]) -> Result<Vec<String>> {
        write_files_within(sandbox, files)
    }

    /// Every committable file, sorted by relative path.
    #[instrument(skip_all, fields(sandbox = %sandbox.display()))]
    pub fn collect_artifacts(&self, sandbox: &Path) -> Result<Vec<GeneratedFile>> {
        let mut files = Vec::new();
        for entry in source_files(sandbox) {
            let entry = entry.with_context(|| format!("walk {}", sandbox.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = relative_path(sandbox, entry.path())?;
            let bytes = fs::read(entry.path())
                .with_context(|| format!("read {}", entry.path().display()))?;
            match String::from_utf8(bytes) {
                Ok(content) => files.push(GeneratedFile { path: rel, content }),
                Err(_) => warn!(path = %rel, "skipping non-UTF-8 artifact"),
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(count = files.len(), "artifacts collected");
        Ok(files)
    }

    /// Empty the sandbox so the next attempt starts from a fresh bootstrap.
    pub fn wipe(&self, sandbox: &Path) -> Result<()> {
        if sandbox.exists() {
            fs::remove_dir_all(sandbox)
                .with_context(|| format!("remove sandbox {}", sandbox.display()))?;
        }
        fs::create_dir_all(sandbox).with_context(|| format!("create sandbox {}", sandbox.display()))?;
        info!(sandbox = %sandbox.display(), "sandbox wiped");
        Ok(())
    }

    /// Delete the run's sandbox and clear its persisted path.
    #[instrument(skip_all, fields(run_id = %run.id))]
    pub fn cleanup(&self, run: &mut DevelopmentRun) -> Result<()> {
        let Some(path) = run.worker_sandbox_path.take() else {
            return Ok(());
        };
        let path = PathBuf::from(path);
        if path.exists() {
            fs::remove_dir_all(&path)
                .with_context(|| format!("remove sandbox {}", path.display()))?;
        }
        debug!(path = %path.display(), "sandbox removed");
        Ok(())
    }
}

/// Write files under `sandbox`, refusing any path that escapes it.
///
/// Unsafe paths fail with [`InvalidWorkspacePath`] before anything is written.
pub fn write_files_within(sandbox: &Path, files: &[GeneratedFile]) -> Result<Vec<String>> {
    let mut planned = Vec::with_capacity(files.len());
    for file in files {
        planned.push((sanitize_workspace_path(&file.path)?, &file.content));
    }
    let root = fs::canonicalize(sandbox)
        .with_context(|| format!("resolve sandbox {}", sandbox.display()))?;

    let mut written = Vec::with_capacity(planned.len());
    for (rel, content) in planned {
        let target = root.join(&rel);
        let parent = target
            .parent()
            .ok_or_else(|| anyhow!("path has no parent: {rel}"))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
        let resolved_parent = fs::canonicalize(parent)
            .with_context(|| format!("resolve {}", parent.display()))?;
        let is_link = fs::symlink_metadata(&target)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if !resolved_parent.starts_with(&root) || is_link {
            return Err(InvalidWorkspacePath {
                path: rel,
                reason: "escapes sandbox",
            }
            .into());
        }
        fs::write(&target, content).with_context(|| format!("write {}", target.display()))?;
        written.push(rel);
    }
    Ok(written)
}

/// Walk `root`, skipping dependency, build and VCS directories.
pub fn source_files(root: &Path) -> impl Iterator<Item = walkdir::Result<walkdir::DirEntry>> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !(entry.file_type().is_dir()
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| EXCLUDED_DIRS.contains(&name)))
        })
}

/// `/`-separated path of `path` relative to `root`.
pub fn relative_path(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

#[derive(Debug, Serialize)]
struct PageContext {
    title: String,
    route: String,
    purpose: Option<String>,
    component: String,
    file: String,
}

#[derive(Debug, Serialize)]
struct FieldContext {
    name: String,
    ts_type: String,
}

#[derive(Debug, Serialize)]
struct EntityContext {
    name: String,
    type_name: String,
    fields: Vec<FieldContext>,
}

fn template_env() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("readme", README_TEMPLATE)?;
    env.add_template("page", PAGE_TEMPLATE)?;
    env.add_template("model", MODEL_TEMPLATE)?;
    env.add_template("package_json", PACKAGE_JSON_TEMPLATE)?;
    Ok(env)
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn product_name(plans: &PlansSnapshot) -> String {
    str_field(&plans.business_plan, &["productName", "name", "title"])
        .unwrap_or("Generated App")
        .to_string()
}

fn pascal_case(raw: &str) -> String {
    slugify(raw)
        .split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

fn pages_from(plans: &PlansSnapshot) -> Vec<PageContext> {
    let Some(pages) = plans.ux_plan.get("pages").and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for page in pages {
        let Some(title) = str_field(page, &["name", "title"]) else {
            continue;
        };
        let raw_route = str_field(page, &["route", "path"])
            .map(str::to_string)
            .unwrap_or_else(|| format!("/{}", slugify(title)));
        let route_dir = raw_route.trim_matches('/');
        let file = if route_dir.is_empty() {
            "src/app/page.tsx".to_string()
        } else {
            match sanitize_workspace_path(&format!("src/app/{route_dir}/page.tsx")) {
                Ok(path) => path,
                Err(err) => {
                    warn!(%err, "skipping page with unsafe route");
                    continue;
                }
            }
        };
        out.push(PageContext {
            title: title.to_string(),
            route: format!("/{route_dir}"),
            purpose: str_field(page, &["purpose", "description"]).map(str::to_string),
            component: format!("{}Page", pascal_case(title)),
            file,
        });
    }
    out
}

fn ts_type(raw: &str) -> &'static str {
    match raw.to_ascii_lowercase().as_str() {
        "number" | "int" | "integer" | "float" | "decimal" => "number",
        "boolean" | "bool" => "boolean",
        "date" | "datetime" | "timestamp" => "Date",
        _ => "string",
    }
}

fn entities_from(plans: &PlansSnapshot) -> Vec<EntityContext> {
    let Some(entities) = plans
        .technical_plan
        .get("dataModel")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    entities
        .iter()
        .filter_map(|entity| {
            let name = str_field(entity, &["name"])?;
            let fields = entity
                .get("fields")
                .and_then(Value::as_array)
                .map(|fields| {
                    fields
                        .iter()
                        .filter_map(|field| {
                            let field_name = str_field(field, &["name"])?;
                            let kind = str_field(field, &["type"]).unwrap_or("string");
                            Some(FieldContext {
                                name: field_name.to_string(),
                                ts_type: ts_type(kind).to_string(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(EntityContext {
                name: name.to_string(),
                type_name: pascal_case(name),
                fields,
            })
        })
        .collect()
}

fn render_base_templates(plans: &PlansSnapshot) -> Result<Vec<GeneratedFile>> {
    let env = template_env()?;
    let pages = pages_from(plans);
    let entities = entities_from(plans);

    let mut files = vec![
        GeneratedFile {
            path: ".gitignore".to_string(),
            content: GITIGNORE.to_string(),
        },
        GeneratedFile {
            path: "README.md".to_string(),
            content: env.get_template("readme")?.render(context! {
                product_name => product_name(plans),
                summary => str_field(&plans.business_plan, &["summary", "description"]),
                pages => &pages,
                entities => &entities,
            })?,
        },
    ];
    let page_template = env.get_template("page")?;
    for page in &pages {
        files.push(GeneratedFile {
            path: page.file.clone(),
            content: page_template.render(page)?,
        });
    }
    if !entities.is_empty() {
        files.push(GeneratedFile {
            path: "src/lib/model.ts".to_string(),
            content: env
                .get_template("model")?
                .render(context! { entities => &entities })?,
        });
    }
    Ok(files)
}

fn fallback_skeleton(plans: &PlansSnapshot) -> Result<Vec<GeneratedFile>> {
    let env = template_env()?;
    let package_json = env
        .get_template("package_json")?
        .render(context! { package_name => slugify(&product_name(plans)) })?;
    let file = |path: &str, content: &str| GeneratedFile {
        path: path.to_string(),
        content: content.to_string(),
    };
    Ok(vec![
        file("package.json", &package_json),
        file("tsconfig.json", TSCONFIG),
        file("next-env.d.ts", NEXT_ENV),
        file("src/app/layout.tsx", ROOT_LAYOUT),
        file("src/app/page.tsx", HOME_PAGE),
        file("vitest.config.ts", VITEST_CONFIG),
        file("features/.gitkeep", ""),
    ])
}
