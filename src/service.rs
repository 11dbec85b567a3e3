use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use hyper::client::HttpConnector;
use hyper::{Client, Uri};
use tokio::runtime::Runtime;
use tracing::debug;

use crate::config::{ServiceSpec, ToolCommand};
use crate::runner::{StageRunner, TracingSink};

pub trait ServiceController {
    fn rebuild(&self) -> Result<()>;
    fn restart(&self) -> Result<()>;
    /// `Ok` only when the service reports ready with the new model loaded.
    fn probe(&self) -> Result<()>;
}

pub struct HttpHealthProbe {
    uri: Uri,
    timeout: Duration,
    client: Client<HttpConnector>,
    runtime: Runtime,
}

impl HttpHealthProbe {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .with_context(|| format!("Invalid health URL: {url}"))?;
        if uri.scheme_str() != Some("http") {
            bail!("Health URL must use plain http: {url}");
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build health probe runtime")?;
        let client = Client::builder().pool_max_idle_per_host(0).build_http();
        Ok(Self {
            uri,
            timeout,
            client,
            runtime,
        })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn check(&self) -> Result<()> {
        let request = self.client.get(self.uri.clone());
        let response = self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, request).await })
            .map_err(|_| anyhow!("health probe timed out after {:?}", self.timeout))?
            .with_context(|| format!("health probe to {} failed", self.uri))?;

        let status = response.status();
        debug!(uri = %self.uri, status = status.as_u16(), "Health probe answered");
        if status.is_success() {
            Ok(())
        } else {
            Err(anyhow!("health endpoint returned {status}"))
        }
    }
}

pub struct ComposeController {
    compose_file: PathBuf,
    service: String,
    working_dir: PathBuf,
    runner: StageRunner,
    probe: HttpHealthProbe,
}

impl ComposeController {
    pub fn new(settings: &ServiceSpec, working_dir: &Path) -> Result<Self> {
        Ok(Self {
            compose_file: settings.compose_file.clone(),
            service: settings.name.clone(),
            working_dir: working_dir.to_path_buf(),
            runner: StageRunner::default(),
            probe: HttpHealthProbe::new(&settings.health_url, Duration::from_secs(5))?,
        })
    }

    fn compose(&self, action: &str, args: &[&str]) -> Result<()> {
        let compose_file = self.compose_file.to_string_lossy().to_string();
        let mut command = ToolCommand::new("docker", &["compose", "-f", compose_file.as_str()]);
        command.args.extend(args.iter().map(|a| a.to_string()));
        command.args.push(self.service.clone());

        self.runner
            .run(action, &command, &[], &self.working_dir, &TracingSink)?
            .check()?;
        Ok(())
    }
}

impl ServiceController for ComposeController {
    fn rebuild(&self) -> Result<()> {
        self.compose("rebuild", &["build"])
    }

    fn restart(&self) -> Result<()> {
        self.compose("restart", &["up", "-d"])
    }

    fn probe(&self) -> Result<()> {
        self.probe.check()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoService;

impl ServiceController for NoService {
    fn rebuild(&self) -> Result<()> {
        bail!("service control is disabled for this run")
    }

    fn restart(&self) -> Result<()> {
        bail!("service control is disabled for this run")
    }

    fn probe(&self) -> Result<()> {
        bail!("service control is disabled for this run")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn serve_once(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let response =
                    format!("{status_line}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok");
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/health")
    }

    #[test]
    fn probe_accepts_success_status() {
        let url = serve_once("HTTP/1.1 200 OK");
        let probe = HttpHealthProbe::new(&url, Duration::from_secs(5)).unwrap();
        probe.check().unwrap();
    }

    #[test]
    fn probe_rejects_unavailable_service() {
        let url = serve_once("HTTP/1.1 503 Service Unavailable");
        let probe = HttpHealthProbe::new(&url, Duration::from_secs(5)).unwrap();
        let err = probe.check().unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn probe_reports_refused_connection() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let probe =
            HttpHealthProbe::new(&format!("http://{addr}/health"), Duration::from_secs(5)).unwrap();
        assert!(probe.check().is_err());
    }

    #[test]
    fn disabled_service_refuses_every_action() {
        assert!(NoService.rebuild().is_err());
        assert!(NoService.restart().is_err());
        assert!(NoService.probe().is_err());
    }

    #[test]
    fn https_urls_are_rejected() {
        assert!(HttpHealthProbe::new("https://localhost/health", Duration::from_secs(1)).is_err());
    }
}
