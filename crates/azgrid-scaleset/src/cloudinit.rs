//! First-boot startup script rendering.
//!
//! Each provisioned VM runs a shell script assembled here: temp-disk
//! setup from the template, the master's git identity and credentials,
//! an optional clone of the master's project environment, and finally
//! the worker (or detached-service) launch line. The whole script is
//! base64-encoded into the resource's `customData`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

/// A project environment on a non-default git branch, replicated onto
/// workers so they run the same code as the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectEnv {
    pub remote: String,
    pub branch: String,
    pub dir_name: String,
}

/// Everything the script renderer needs to know.
#[derive(Debug, Clone)]
pub struct ScriptParams {
    /// Temp-disk preamble from the template (mkfs/mount commands).
    pub tempdisk: String,
    /// Unix user the worker runs as.
    pub user: String,
    /// The master's home directory, read for git identity files.
    pub master_home: PathBuf,
    /// The master's active project directory, replicated when it is a
    /// git checkout on a non-default branch.
    pub project_dir: Option<PathBuf>,
    /// Worker runtime executable and flags.
    pub exename: String,
    pub exeflags: String,
    /// Extra environment exports for the worker process.
    pub env: BTreeMap<String, String>,
    pub julia_num_threads: String,
    pub omp_num_threads: u32,
    /// Cluster handshake inputs.
    pub cookie: String,
    pub master_addr: String,
    pub master_port: u16,
    pub ppi: u32,
    /// MPI launch shape; zero ranks means a plain cluster worker.
    pub mpi_ranks_per_worker: u32,
    pub mpi_flags: String,
}

impl Default for ScriptParams {
    fn default() -> Self {
        Self {
            tempdisk: String::new(),
            user: "azureuser".to_string(),
            master_home: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root")),
            project_dir: None,
            exename: "julia".to_string(),
            exeflags: String::new(),
            env: BTreeMap::new(),
            julia_num_threads: "1".to_string(),
            omp_num_threads: 1,
            cookie: String::new(),
            master_addr: String::new(),
            master_port: 0,
            ppi: 1,
            mpi_ranks_per_worker: 0,
            mpi_flags: String::new(),
        }
    }
}

/// Base64 for `customData`.
pub fn encode(script: &str) -> String {
    STANDARD.encode(script)
}

/// Render the script that boots a cluster worker VM.
pub fn build_worker_script(p: &ScriptParams) -> String {
    let mut script = header(&p.tempdisk);
    push_git_identity(&mut script, p);
    push_project_env(&mut script, p);
    script.push_str(&launch_heredoc(p, &worker_launch_line(p)));
    script
}

/// Render the script that boots a detached-service VM: same identity
/// seeding, then an SSH key pair and the HTTP job service on port 8081.
pub fn build_detached_script(p: &ScriptParams) -> String {
    let mut script = header(&p.tempdisk);
    push_git_identity(&mut script, p);
    push_project_env(&mut script, p);
    let launch = format!(
        "ssh-keygen -t rsa -f /home/{user}/.ssh/id_rsa -N ''\n\
         azgridd detached-server --bind 0.0.0.0:8081 --user {user} \
         >> /home/{user}/detached.log 2>&1 &",
        user = p.user
    );
    script.push_str(&launch_heredoc(p, &launch));
    script
}

fn header(tempdisk: &str) -> String {
    let mut s = String::from("#!/bin/sh\n");
    if !tempdisk.is_empty() {
        s.push_str(tempdisk);
        s.push('\n');
    }
    s
}

/// Copy the master's `.gitconfig` and `.git-credentials` into the
/// worker user's home, when they exist on the master.
fn push_git_identity(script: &mut String, p: &ScriptParams) {
    if let Ok(gitconfig) = std::fs::read_to_string(p.master_home.join(".gitconfig")) {
        script.push_str(&format!(
            "su - {user} <<'AZG_GITCONFIG_BLOCK'\n\
             cat > ~/.gitconfig <<'GITCONFIG'\n\
             {gitconfig}\n\
             GITCONFIG\n\
             AZG_GITCONFIG_BLOCK\n",
            user = p.user,
        ));
    }
    if let Ok(credentials) = std::fs::read_to_string(p.master_home.join(".git-credentials")) {
        script.push_str(&format!(
            "su - {user} <<'AZG_CREDENTIALS_BLOCK'\n\
             cat > ~/.git-credentials <<'CREDENTIALS'\n\
             {credentials}\n\
             CREDENTIALS\n\
             chmod 600 ~/.git-credentials\n\
             AZG_CREDENTIALS_BLOCK\n",
            user = p.user,
        ));
    }
}

/// Clone/fetch/checkout the master's project environment and
/// instantiate it, signalling completion through a marker file.
fn push_project_env(script: &mut String, p: &ScriptParams) {
    let Some(dir) = &p.project_dir else { return };
    let Some(env) = detect_project_env(dir) else { return };
    debug!(branch = %env.branch, "replicating custom project environment");
    script.push_str(&format!(
        "su - {user} <<'AZG_PROJECT_BLOCK'\n\
         if [ ! -d {dir} ]; then git clone {remote} {dir}; fi\n\
         cd {dir}\n\
         git fetch origin\n\
         git checkout {branch}\n\
         git pull origin {branch}\n\
         {exename} --project=/home/{user}/{dir} -e 'using Pkg; Pkg.instantiate(); Pkg.precompile()'\n\
         touch /tmp/julia_instantiate_done\n\
         AZG_PROJECT_BLOCK\n",
        user = p.user,
        dir = env.dir_name,
        remote = env.remote,
        branch = env.branch,
        exename = p.exename,
    ));
}

/// The final heredoc: environment exports, thread counts, launch line.
fn launch_heredoc(p: &ScriptParams, launch: &str) -> String {
    let mut exports = String::new();
    for (key, value) in &p.env {
        exports.push_str(&format!("export {key}={value}\n"));
    }
    format!(
        "su - {user} <<AZG_LAUNCH_BLOCK\n\
         export JULIA_NUM_THREADS={jnt}\n\
         export OMP_NUM_THREADS={omp}\n\
         {exports}{launch}\n\
         AZG_LAUNCH_BLOCK\n",
        user = p.user,
        jnt = p.julia_num_threads,
        omp = p.omp_num_threads,
    )
}

fn worker_launch_line(p: &ScriptParams) -> String {
    if p.mpi_ranks_per_worker > 0 {
        format!(
            "mpirun -n {ranks} {flags} {exename} {exeflags} -e 'azure_worker_mpi(\"{cookie}\", \"{addr}\", {port}, {ppi})'",
            ranks = p.mpi_ranks_per_worker,
            flags = p.mpi_flags,
            exename = p.exename,
            exeflags = p.exeflags,
            cookie = p.cookie,
            addr = p.master_addr,
            port = p.master_port,
            ppi = p.ppi,
        )
    } else {
        format!(
            "{exename} {exeflags} -e 'azure_worker(\"{cookie}\", \"{addr}\", {port}, {ppi})'",
            exename = p.exename,
            exeflags = p.exeflags,
            cookie = p.cookie,
            addr = p.master_addr,
            port = p.master_port,
            ppi = p.ppi,
        )
    }
}

/// Inspect a directory's `.git` for a checkout on a non-default branch.
///
/// Reads `HEAD` for the branch and `config` for the origin URL; a
/// detached HEAD or a default branch (`main`/`master`) yields `None`.
pub fn detect_project_env(dir: &Path) -> Option<ProjectEnv> {
    let head = std::fs::read_to_string(dir.join(".git/HEAD")).ok()?;
    let branch = head.trim().strip_prefix("ref: refs/heads/")?.to_string();
    if branch == "main" || branch == "master" {
        return None;
    }

    let config = std::fs::read_to_string(dir.join(".git/config")).ok()?;
    let remote = parse_origin_url(&config)?;
    let dir_name = dir.file_name()?.to_string_lossy().to_string();
    Some(ProjectEnv {
        remote,
        branch,
        dir_name,
    })
}

/// Pull `url` out of the `[remote "origin"]` section of a git config.
fn parse_origin_url(config: &str) -> Option<String> {
    let mut in_origin = false;
    for line in config.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_origin = line == r#"[remote "origin"]"#;
            continue;
        }
        if in_origin {
            if let Some(url) = line.strip_prefix("url").map(|r| r.trim_start_matches([' ', '='])) {
                return Some(url.trim().to_string());
            }
        }
    }
    None
}
