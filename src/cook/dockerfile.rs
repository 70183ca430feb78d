//! Dockerfile generation
//!
//! Two independent renderers produce the build-file text plus a
//! spooled file-context tar. The source stage injects the resolved
//! source tree into the starting image; the build stage installs
//! dependencies on top of the cached base image and embeds the
//! generated build script as the container's command.

use crate::cook::flavour::Flavour;
use crate::error::{KilnError, KilnResult};
use crate::recipe::Recipe;
use crate::source::tarstream::{self, ChainReader, TarMember};
use crate::source::{SourceCache, SourceSpec};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::info;

/// Build directory inside the images
pub const BUILD_DIR: &str = "/tmp/build";
/// Where the generated script lands in the build image
pub const SCRIPT_PATH: &str = "/tmp/build.sh";
/// Script filename inside the build context
const SCRIPT_NAME: &str = ".build.sh";

/// A rendered stage: build-file text plus its spooled context tar
pub struct Stage {
    pub dockerfile: String,
    pub context: File,
}

/// Render the source stage: starting image plus the source tree
/// mapped into the build directory
pub fn source_stage(
    image: &str,
    source: &dyn SourceCache,
    spec: &SourceSpec,
) -> KilnResult<Stage> {
    let prefix = source.prefix()?;
    let file_map = effective_file_map(spec, prefix.as_deref());

    if let [(from, to)] = spec
        .file_map
        .iter()
        .map(|(f, t)| (f.as_str(), t.as_str()))
        .collect::<Vec<_>>()
        .as_slice()
    {
        if *from == prefix.clone().unwrap_or_default() && to.is_empty() {
            info!("hint: file map entry {from:?} -> \"\" is the default and can be dropped");
        }
    }

    let mut dockerfile = String::new();
    dockerfile.push_str(&format!("FROM {image}\n"));
    dockerfile.push_str(&format!("RUN mkdir -p {BUILD_DIR}\n"));
    for (from, to) in &file_map {
        let from = if from.is_empty() { "." } else { from.as_str() };
        dockerfile.push_str(&format!("COPY {from} {}\n", map_target(to)));
    }

    let members = vec![TarMember::new("Dockerfile", 0o644, dockerfile.clone())];
    let context = spool_context(members, Some(source.tar()?))?;
    Ok(Stage {
        dockerfile,
        context,
    })
}

/// The file map with the default `{prefix-or-"" -> ""}` applied
fn effective_file_map(spec: &SourceSpec, prefix: Option<&str>) -> Vec<(String, String)> {
    if spec.file_map.is_empty() {
        vec![(prefix.unwrap_or("").to_string(), String::new())]
    } else {
        spec.file_map
            .iter()
            .map(|(from, to)| (from.clone(), to.clone()))
            .collect()
    }
}

fn map_target(to: &str) -> String {
    if to.is_empty() {
        BUILD_DIR.to_string()
    } else {
        format!("{BUILD_DIR}/{to}")
    }
}

/// Everything the build stage needs to render
pub struct BuildStage<'a> {
    pub base_image: &'a str,
    pub recipe: &'a Recipe,
    pub flavour: Flavour,
    /// Prepend the flavour's index refresh command
    pub refresh_index: bool,
    /// Directory build-mount files resolve against
    pub mount_dir: &'a Path,
}

/// Render the build stage on top of the cached base image
pub fn build_stage(spec: &BuildStage<'_>) -> KilnResult<Stage> {
    let recipe = spec.recipe;
    let workdir = match recipe.source.subdir.as_deref() {
        Some(subdir) if !subdir.is_empty() => format!("{BUILD_DIR}/{subdir}"),
        _ => BUILD_DIR.to_string(),
    };

    let mut dockerfile = String::new();
    dockerfile.push_str(&format!("FROM {}\n", spec.base_image));
    dockerfile.push_str(&format!("WORKDIR {workdir}\n"));

    let mut members = Vec::new();
    for mount in &recipe.mount_files {
        let path = spec.mount_dir.join(mount);
        let data = std::fs::read(&path)
            .map_err(|e| KilnError::io(format!("reading mount file {}", path.display()), e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| KilnError::PathNotFound(path.clone()))?;
        dockerfile.push_str(&format!("COPY {name} {workdir}/{name}\n"));
        members.push(TarMember::new(name, 0o644, data));
    }

    if spec.refresh_index {
        dockerfile.push_str(&format!("RUN {}\n", spec.flavour.index_refresh_command()));
    }
    for command in &recipe.before_dependencies {
        dockerfile.push_str(&format!("RUN {command}\n"));
    }

    let packages = install_set(recipe);
    if !packages.is_empty() {
        dockerfile.push_str(&format!("RUN {}\n", spec.flavour.install_command(&packages)));
    }

    for command in &recipe.before_build {
        dockerfile.push_str(&format!("RUN {command}\n"));
    }

    dockerfile.push_str(&format!("COPY {SCRIPT_NAME} {SCRIPT_PATH}\n"));
    dockerfile.push_str(&format!("CMD [\"/bin/bash\",\"{SCRIPT_PATH}\"]\n"));

    members.insert(
        0,
        TarMember::new("Dockerfile", 0o644, dockerfile.clone()),
    );
    members.push(TarMember::new(SCRIPT_NAME, 0o755, build_script(recipe)));

    let context = spool_context(members, None)?;
    Ok(Stage {
        dockerfile,
        context,
    })
}

/// Merged, de-duplicated, alphabetically sorted installer arguments
/// from build- and runtime-dependencies
fn install_set(recipe: &Recipe) -> Vec<String> {
    let mut set = BTreeSet::new();
    for (name, spec) in recipe.build_depends.iter().chain(recipe.depends.iter()) {
        if let Some(install) = spec.install_name(name) {
            set.insert(install);
        }
    }
    set.into_iter().collect()
}

/// The generated build script: one echoed, highlighted step name per
/// step, then its command, in declaration order
pub fn build_script(recipe: &Recipe) -> String {
    let mut script = String::from("#!/bin/bash\nset -e\n");
    for step in &recipe.steps {
        let name = step.name.replace('\'', "'\\''");
        script.push_str(&format!(
            "echo -e '\\e[1;36m==> {name}\\e[0m'\n{}\n",
            step.run
        ));
    }
    script
}

/// Spool context members (and an optional trailing source tar) into a
/// rewound temp file
fn spool_context(
    members: Vec<TarMember>,
    source_tar: Option<Box<dyn Read + Send>>,
) -> KilnResult<File> {
    let mut spool = tempfile::tempfile().map_err(|e| KilnError::io("creating spool file", e))?;

    match source_tar {
        Some(tail) => {
            // chain the member tar (trailer stripped) ahead of the
            // complete source tar
            let head = tarstream::members_tar(&members)?;
            let mut chain = ChainReader::new()
                .push(std::io::Cursor::new(head))
                .push(tail);
            let mut buf = [0u8; 8192];
            loop {
                let n = chain
                    .read(&mut buf)
                    .map_err(|e| KilnError::io("assembling build context", e))?;
                if n == 0 {
                    break;
                }
                spool
                    .write_all(&buf[..n])
                    .map_err(|e| KilnError::io("spooling build context", e))?;
            }
        }
        None => {
            let mut builder = tar::Builder::new(&mut spool);
            for member in &members {
                let mut header = tar::Header::new_gnu();
                header.set_size(member.data.len() as u64);
                header.set_mode(member.mode);
                header.set_mtime(0);
                header.set_cksum();
                builder
                    .append_data(&mut header, &member.name, member.data.as_slice())
                    .map_err(|e| {
                        KilnError::io(format!("appending context member {}", member.name), e)
                    })?;
            }
            builder
                .finish()
                .map_err(|e| KilnError::io("finishing build context", e))?;
            drop(builder);
        }
    }

    spool
        .seek(SeekFrom::Start(0))
        .map_err(|e| KilnError::io("rewinding build context", e))?;
    Ok(spool)
}
