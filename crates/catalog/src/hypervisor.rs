//! Narrow contract to the local hypervisor: find, register and rename VMs.

use crate::error::{CatalogError, CatalogResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, instrument};

/// A registered virtual machine.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct VmInfo {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Home", default)]
    pub home: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterVmRequest {
    pub path: PathBuf,
    pub machine_name: String,
    pub owner: Option<String>,
    pub regenerate_source_uuid: bool,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Look a VM up by name or id.
    async fn get_vm(&self, name: &str) -> CatalogResult<Option<VmInfo>>;

    async fn register_vm(&self, request: &RegisterVmRequest) -> CatalogResult<()>;

    /// VMs whose home folder is `home`.
    async fn find_vms_by_home(&self, home: &Path) -> CatalogResult<Vec<VmInfo>>;

    async fn rename_vm(&self, id: &str, new_name: &str) -> CatalogResult<()>;
}

/// Drives Parallels Desktop through `prlctl`.
#[derive(Clone, Debug)]
pub struct PrlctlHypervisor {
    program: PathBuf,
}

impl Default for PrlctlHypervisor {
    fn default() -> Self {
        Self {
            program: PathBuf::from("prlctl"),
        }
    }
}

impl PrlctlHypervisor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> CatalogResult<String> {
        debug!(program = %self.program.display(), ?args, "running hypervisor command");
        let output = Command::new(&self.program).args(args).output().await?;
        if !output.status.success() {
            return Err(CatalogError::Hypervisor(format!(
                "{} {} failed: {}",
                self.program.display(),
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn list(&self) -> CatalogResult<Vec<VmInfo>> {
        let out = self.run(&["list", "-a", "-i", "--json"]).await?;
        if out.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&out)?)
    }
}

#[async_trait]
impl Hypervisor for PrlctlHypervisor {
    #[instrument(skip(self))]
    async fn get_vm(&self, name: &str) -> CatalogResult<Option<VmInfo>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|vm| vm.name.eq_ignore_ascii_case(name) || vm.id.trim_matches(['{', '}']) == name))
    }

    #[instrument(skip(self))]
    async fn register_vm(&self, request: &RegisterVmRequest) -> CatalogResult<()> {
        let path = request.path.to_string_lossy();
        let mut args = vec!["register", path.as_ref()];
        if request.regenerate_source_uuid {
            args.push("--regenerate-src-uuid");
        }
        self.run(&args).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_vms_by_home(&self, home: &Path) -> CatalogResult<Vec<VmInfo>> {
        let wanted = home.to_string_lossy();
        let wanted = wanted.trim_end_matches('/');
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|vm| vm.home.to_string_lossy().trim_end_matches('/') == wanted)
            .collect())
    }

    #[instrument(skip(self))]
    async fn rename_vm(&self, id: &str, new_name: &str) -> CatalogResult<()> {
        self.run(&["set", id, "--name", new_name]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prlctl_listing() {
        let json = r#"[{"ID":"{abc}","Name":"ubuntu","Home":"/vms/ubuntu.pvm/","State":"stopped"}]"#;
        let vms: Vec<VmInfo> = serde_json::from_str(json).unwrap();
        assert_eq!(vms[0].name, "ubuntu");
        assert_eq!(vms[0].home, PathBuf::from("/vms/ubuntu.pvm/"));
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let hv = PrlctlHypervisor::new("/nonexistent/prlctl");
        assert!(hv.get_vm("ubuntu").await.is_err());
    }
}
