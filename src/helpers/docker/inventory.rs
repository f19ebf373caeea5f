//! Label-filtered inventory of managed images, networks and containers.
//!
//! Cleanup policy (what to keep, how often to run) lives outside this crate;
//! these are the primitives it consumes. Every listing filters on the
//! managed label so host resources we did not create are never touched.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use super::{DockerClient, MANAGED_LABEL};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: i64,
}

fn managed_filter() -> String {
    format!("label={}=true", MANAGED_LABEL)
}

fn lines(output: String) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

impl DockerClient {
    /// `name:tag` of every image carrying the managed label.
    pub async fn list_managed_images(&self) -> Result<Vec<String>, String> {
        let filter = managed_filter();
        let output = self
            .exec_ok([
                "images",
                "--filter",
                filter.as_str(),
                "--format",
                "{{.Repository}}:{{.Tag}}",
            ])
            .await?;
        Ok(lines(output)
            .into_iter()
            .filter(|name| !name.contains("<none>"))
            .collect())
    }

    pub async fn image_created_at(&self, image: &str) -> Result<DateTime<Utc>, String> {
        let raw = self
            .exec_ok(["image", "inspect", "--format", "{{.Created}}", image])
            .await?;
        DateTime::parse_from_rfc3339(raw.trim())
            .map(|t| t.with_timezone(&Utc))
            .map_err(|err| format!("unparseable image timestamp {:?}: {}", raw, err))
    }

    pub async fn image_size(&self, image: &str) -> Result<i64, String> {
        let raw = self
            .exec_ok(["image", "inspect", "--format", "{{.Size}}", image])
            .await?;
        raw.trim()
            .parse::<i64>()
            .map_err(|err| format!("unparseable image size {:?}: {}", raw, err))
    }

    pub async fn image_info(&self, image: &str) -> Result<ImageInfo, String> {
        Ok(ImageInfo {
            name: image.to_string(),
            created_at: self.image_created_at(image).await?,
            size_bytes: self.image_size(image).await?,
        })
    }

    /// Remove an image; false when the engine refused (in use, not found).
    pub async fn remove_image(&self, image: &str) -> bool {
        match self.exec_ok(["rmi", image]).await {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!(image, error = %err, "rmi skipped");
                false
            }
        }
    }

    /// Images currently backing live containers. Never delete these.
    pub async fn running_image_names(&self) -> Result<HashSet<String>, String> {
        let output = self.exec_ok(["ps", "--format", "{{.Image}}"]).await?;
        Ok(lines(output).into_iter().collect())
    }

    /// Ids of dangling (untagged) layers left behind by rebuilds.
    pub async fn dangling_images(&self) -> Result<Vec<String>, String> {
        let output = self
            .exec_ok(["images", "--filter", "dangling=true", "-q"])
            .await?;
        Ok(lines(output))
    }

    pub async fn list_managed_networks(&self) -> Result<Vec<String>, String> {
        let filter = managed_filter();
        let output = self
            .exec_ok([
                "network",
                "ls",
                "--filter",
                filter.as_str(),
                "--format",
                "{{.Name}}",
            ])
            .await?;
        Ok(lines(output))
    }

    /// Whether any container is attached to the network. A network that
    /// cannot be inspected counts as not in use.
    pub async fn network_in_use(&self, name: &str) -> bool {
        match self
            .exec_ok(["network", "inspect", "--format", "{{len .Containers}}", name])
            .await
        {
            Ok(raw) => raw.trim().parse::<usize>().map(|n| n > 0).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Remove every stopped managed container; returns the removed ids.
    pub async fn remove_stopped_containers(&self) -> Result<Vec<String>, String> {
        let filter = managed_filter();
        let output = self
            .exec_ok([
                "ps",
                "-a",
                "--filter",
                filter.as_str(),
                "--filter",
                "status=exited",
                "-q",
            ])
            .await?;
        let mut removed = Vec::new();
        for id in lines(output) {
            match self.exec_ok(["rm", &id]).await {
                Ok(_) => removed.push(id),
                Err(err) => tracing::debug!(container = %id, error = %err, "rm skipped"),
            }
        }
        Ok(removed)
    }
}
