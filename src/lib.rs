use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use tracing::{debug, info, warn};

// dpkg status marker for packages that are wanted and fully installed
pub const INSTALLED_MARKER: &str = "ii";

// What the desired state asks for a package
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Install,
    Remove,
}

// On-disk manifest layout, every level may be missing or null.
// Both spellings of the top-level key may appear; their lists are merged.
#[derive(Deserialize, Debug, Default)]
struct ManifestFile {
    #[serde(default)]
    packages_to_manage: Option<ManifestLists>,
    #[serde(default, rename = "packages to manage")]
    packages_to_manage_spaced: Option<ManifestLists>,
}

#[derive(Deserialize, Debug, Default)]
struct ManifestLists {
    #[serde(default)]
    install: Option<Vec<String>>,
    #[serde(default)]
    remove: Option<Vec<String>>,
}

/// Packages the operator wants installed or absent, in prompt order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub install: Vec<String>,
    pub remove: Vec<String>,
}

impl From<ManifestFile> for DesiredState {
    fn from(file: ManifestFile) -> Self {
        let mut state = Self::default();
        for lists in [file.packages_to_manage, file.packages_to_manage_spaced]
            .into_iter()
            .flatten()
        {
            state.install.extend(lists.install.unwrap_or_default());
            state.remove.extend(lists.remove.unwrap_or_default());
        }
        state
    }
}

impl DesiredState {
    /// Load the desired state from a manifest file
    ///
    /// Files ending in `.json` are parsed as JSON, everything else as YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid manifest.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let content = fs::read_to_string(path_ref)
            .with_context(|| format!("failed to read manifest from {path_str}"))?;

        let is_json = path_ref
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let state = if is_json {
            Self::parse_json(&content)
        } else {
            Self::parse_yaml(&content)
        }
        .with_context(|| format!("failed to parse manifest {path_str}"))?;

        debug!(
            install = state.install.len(),
            remove = state.remove.len(),
            "loaded manifest {path_str}"
        );
        Ok(state)
    }

    /// Parse a YAML manifest. An empty document is an empty desired state.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is not YAML or has the wrong shape.
    pub fn parse_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let value: serde_yaml::Value =
            serde_yaml::from_str(content).context("invalid YAML")?;
        if value.is_null() {
            return Ok(Self::default());
        }

        let file: ManifestFile =
            serde_yaml::from_value(value).context("unexpected manifest structure")?;
        Ok(file.into())
    }

    /// Parse a JSON manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is not JSON or has the wrong shape.
    pub fn parse_json(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let file: ManifestFile = serde_json::from_str(content).context("invalid JSON")?;
        Ok(file.into())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.install.is_empty() && self.remove.is_empty()
    }
}

// True when the root cause of a load error is a missing file
#[must_use]
pub fn is_missing_file(err: &anyhow::Error) -> bool {
    err.root_cause()
        .downcast_ref::<io::Error>()
        .is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
}

/// Extract installed package names from `dpkg -l` output.
///
/// Only rows carrying the `ii` marker count. Names are recorded as printed.
/// A multi-arch name is also recorded bare when its qualifier is the
/// native architecture, since apt resolves a bare name to that one.
#[must_use]
pub fn parse_dpkg_list(output: &str, native_arch: Option<&str>) -> HashSet<String> {
    let mut installed = HashSet::new();

    for line in output.lines() {
        if !line.starts_with(INSTALLED_MARKER) {
            continue;
        }
        let Some(name) = line.split_whitespace().nth(1) else {
            continue;
        };

        if let Some((bare, arch)) = name.split_once(':') {
            if native_arch == Some(arch) {
                installed.insert(bare.to_string());
            }
        }
        installed.insert(name.to_string());
    }

    installed
}

// One desired-state entry checked against the installed set
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PackageStatus {
    pub name: String,
    pub action: Action,
    pub installed: bool,
}

impl PackageStatus {
    // Whether reconciling this entry would change the system
    #[must_use]
    pub fn is_pending(&self) -> bool {
        match self.action {
            Action::Install => !self.installed,
            Action::Remove => self.installed,
        }
    }

    // Listing marker: satisfied, pending install or pending removal
    #[must_use]
    pub fn marker(&self) -> &'static str {
        match (self.is_pending(), self.action) {
            (false, _) => "[✓]",
            (true, Action::Install) => "[+]",
            (true, Action::Remove) => "[-]",
        }
    }
}

// True when any entry still needs a change, i.e. the system has not converged
#[must_use]
pub fn has_pending(statuses: &[PackageStatus]) -> bool {
    statuses.iter().any(PackageStatus::is_pending)
}

/// Diff the desired state against the installed set.
///
/// Install entries come first, then remove entries, each in manifest order.
#[must_use]
pub fn plan(desired: &DesiredState, installed: &HashSet<String>) -> Vec<PackageStatus> {
    let entries = desired
        .install
        .iter()
        .map(|name| (name, Action::Install))
        .chain(desired.remove.iter().map(|name| (name, Action::Remove)));

    entries
        .map(|(name, action)| PackageStatus {
            name: name.clone(),
            action,
            installed: installed.contains(name),
        })
        .collect()
}

// Accept only "y", in either case; only the line terminator is stripped
#[must_use]
pub fn is_affirmative(answer: &str) -> bool {
    answer
        .trim_end_matches(['\r', '\n'])
        .eq_ignore_ascii_case("y")
}

/// System package manager operations the reconciler relies on.
pub trait PackageBackend {
    /// Query the package database for fully installed packages.
    ///
    /// # Errors
    ///
    /// Returns an error if the query tool cannot be run or fails.
    fn installed_packages(&self) -> Result<HashSet<String>>;

    /// Install one package without asking the package manager for confirmation.
    ///
    /// # Errors
    ///
    /// Returns an error if the package manager cannot be run or fails.
    fn install(&mut self, package: &str) -> Result<()>;

    /// Remove one package together with its configuration files.
    ///
    /// # Errors
    ///
    /// Returns an error if the package manager cannot be run or fails.
    fn purge(&mut self, package: &str) -> Result<()>;
}

// What happened to one desired-state entry during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    AlreadyInstalled,
    NotInstalled,
    Declined,
    Installed,
    Removed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageOutcome {
    pub name: String,
    pub action: Action,
    pub outcome: Outcome,
}

/// Interactive reconciliation of a desired state against the system.
///
/// Operator questions are read line by line from `input`; prompts,
/// progress and per-package errors go to `out`.
pub struct Reconciler<B, R, W> {
    backend: B,
    input: R,
    out: W,
    strict: bool,
}

impl<B: PackageBackend, R: BufRead, W: Write> Reconciler<B, R, W> {
    pub fn new(backend: B, input: R, out: W) -> Self {
        Self {
            backend,
            input,
            out,
            strict: false,
        }
    }

    // Fail instead of assuming an empty installed set when the query fails
    #[must_use]
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    /// Load the manifest, reporting problems and falling back to nothing to do.
    ///
    /// # Errors
    ///
    /// Only fails when the report itself cannot be written.
    pub fn load_desired_state(&mut self, path: &Path) -> Result<DesiredState> {
        match DesiredState::from_file(path) {
            Ok(state) => Ok(state),
            Err(e) if is_missing_file(&e) => {
                warn!("manifest {} not found", path.display());
                writeln!(self.out, "error: manifest '{}' not found", path.display())?;
                Ok(DesiredState::default())
            }
            Err(e) => {
                warn!("ignoring unreadable manifest: {e:#}");
                writeln!(self.out, "error: {e:#}")?;
                Ok(DesiredState::default())
            }
        }
    }

    /// Query the installed set.
    ///
    /// A failed query is reported and treated as an empty set unless the
    /// reconciler is strict.
    ///
    /// # Errors
    ///
    /// Returns the query error in strict mode, or an error if the report
    /// cannot be written.
    pub fn installed_packages(&mut self) -> Result<HashSet<String>> {
        match self.backend.installed_packages() {
            Ok(installed) => Ok(installed),
            Err(e) if self.strict => Err(e.context("failed to list installed packages")),
            Err(e) => {
                writeln!(self.out, "error listing installed packages: {e:#}")?;
                warn!("continuing as if no packages were installed");
                Ok(HashSet::new())
            }
        }
    }

    /// Load the manifest, query the system and reconcile.
    ///
    /// # Errors
    ///
    /// Fails on console I/O errors, or on a failed query in strict mode.
    pub fn run(&mut self, manifest: &Path) -> Result<Vec<PackageOutcome>> {
        let desired = self.load_desired_state(manifest)?;
        let installed = self.installed_packages()?;
        self.reconcile(&desired, &installed)
    }

    /// Walk the install list, then the remove list, confirming each change.
    ///
    /// # Errors
    ///
    /// Fails only on console I/O errors. Package manager failures are
    /// reported and recorded as [`Outcome::Failed`].
    pub fn reconcile(
        &mut self,
        desired: &DesiredState,
        installed: &HashSet<String>,
    ) -> Result<Vec<PackageOutcome>> {
        let (to_install, to_remove): (Vec<_>, Vec<_>) = plan(desired, installed)
            .into_iter()
            .partition(|status| status.action == Action::Install);
        let mut outcomes = Vec::with_capacity(to_install.len() + to_remove.len());

        writeln!(self.out, "\n--- packages to install ---")?;
        for status in to_install {
            let outcome = self.install_step(&status)?;
            outcomes.push(PackageOutcome {
                name: status.name,
                action: status.action,
                outcome,
            });
        }

        writeln!(self.out, "\n--- packages to remove and purge ---")?;
        for status in to_remove {
            let outcome = self.remove_step(&status)?;
            outcomes.push(PackageOutcome {
                name: status.name,
                action: status.action,
                outcome,
            });
        }

        writeln!(self.out, "\n--- task complete ---")?;
        info!(entries = outcomes.len(), "reconciliation finished");
        Ok(outcomes)
    }

    fn install_step(&mut self, status: &PackageStatus) -> Result<Outcome> {
        let package = status.name.as_str();
        if status.installed {
            writeln!(self.out, "package '{package}' is already installed")?;
            return Ok(Outcome::AlreadyInstalled);
        }
        if !self.confirm(&format!("install package '{package}'?"))? {
            return Ok(Outcome::Declined);
        }

        writeln!(self.out, "installing {package}...")?;
        match self.backend.install(package) {
            Ok(()) => {
                writeln!(self.out, "successfully installed {package}")?;
                Ok(Outcome::Installed)
            }
            Err(e) => {
                writeln!(self.out, "error installing {package}: {e:#}")?;
                Ok(Outcome::Failed(format!("{e:#}")))
            }
        }
    }

    fn remove_step(&mut self, status: &PackageStatus) -> Result<Outcome> {
        let package = status.name.as_str();
        if !status.installed {
            writeln!(self.out, "package '{package}' is not currently installed")?;
            return Ok(Outcome::NotInstalled);
        }
        if !self.confirm(&format!("remove and purge package '{package}'?"))? {
            return Ok(Outcome::Declined);
        }

        writeln!(self.out, "removing and purging {package}...")?;
        match self.backend.purge(package) {
            Ok(()) => {
                writeln!(self.out, "successfully removed and purged {package}")?;
                Ok(Outcome::Removed)
            }
            Err(e) => {
                writeln!(self.out, "error removing and purging {package}: {e:#}")?;
                Ok(Outcome::Failed(format!("{e:#}")))
            }
        }
    }

    // Ask a yes/no question; end of input counts as no
    fn confirm(&mut self, question: &str) -> Result<bool> {
        write!(self.out, "{question} (y/N): ")?;
        self.out.flush().context("failed to flush prompt")?;

        let mut answer = String::new();
        let read = self
            .input
            .read_line(&mut answer)
            .context("failed to read answer from operator")?;
        if read == 0 {
            writeln!(self.out)?;
            debug!("end of input, treating as no");
            return Ok(false);
        }

        Ok(is_affirmative(&answer))
    }
}
