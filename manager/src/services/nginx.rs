//! nginx site configuration

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::cmd::{CommandRunner, CommandSpec};
use crate::errors::ManagerError;
use crate::filesys::file::{remove_link, File};
use crate::models::app::{AppType, ApplicationRecord};
use crate::services::maintenance::MaintenancePage;
use crate::storage::layout::SystemPaths;

/// Marker every rendered site carries once it routes errors to the maintenance pages
const MAINTENANCE_MARKER: &str = "error_page 502 503 504 /error502.html;";

/// First line of a maintenance-mode site
const MAINTENANCE_HEADER: &str = "# Maintenance mode";

/// Result of `nginx -t`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigTest {
    pub ok: bool,
    pub output: String,
}

/// Renders, installs and removes nginx sites
#[derive(Clone)]
pub struct NginxService {
    paths: SystemPaths,
    runner: Arc<dyn CommandRunner>,
}

impl NginxService {
    pub fn new(paths: SystemPaths, runner: Arc<dyn CommandRunner>) -> Self {
        Self { paths, runner }
    }

    /// Site configuration for a record
    pub fn render(&self, record: &ApplicationRecord) -> String {
        let body = match record.app_type {
            AppType::Static => self.static_locations(record),
            AppType::Fastapi => {
                let mut body = self.proxy_location("/", record.port, "64k", "8 64k");
                body.push_str(&self.passthrough("/docs", record.port));
                body.push_str(&self.passthrough("/redoc", record.port));
                body
            }
            AppType::Nextjs => {
                let mut body = self.proxy_location("/", record.port, "128k", "4 256k");
                body.push_str(&format!(
                    r#"
    location /_next/static/ {{
        proxy_pass http://127.0.0.1:{port};
        expires 1y;
        add_header Cache-Control "public, immutable";
    }}
"#,
                    port = record.port
                ));
                body
            }
            AppType::Nodejs => self.proxy_location("/", record.port, "128k", "4 256k"),
        };

        format!(
            "# {kind} application: {domain}\n# Managed by webmgr; manual edits are overwritten\n\n{server}",
            kind = record.app_type,
            domain = record.domain,
            server = self.server_block(record, &body)
        )
    }

    /// Configuration that answers every request with a maintenance page
    pub fn render_maintenance(&self, record: &ApplicationRecord, page: MaintenancePage) -> String {
        let body = format!(
            r#"
    location / {{
        return 503;
    }}

    error_page 503 /{page};
    location = /{page} {{
        root {root};
        internal;
        add_header Retry-After 30 always;
        add_header Cache-Control "no-store" always;
    }}
"#,
            page = page.file_name(),
            root = self.paths.maintenance_dir.display()
        );
        format!(
            "{header} ({page}): {domain}\n# Managed by webmgr\n\n{server}",
            header = MAINTENANCE_HEADER,
            page = page.file_name(),
            domain = record.domain,
            server = self.bare_server_block(record, &body)
        )
    }

    /// Write, enable and validate a site, then reload.
    ///
    /// A site that cannot be enabled, or that nginx rejects, is rolled back to
    /// the previous content (or removed) before the error is returned, so
    /// nginx stays reloadable.
    pub async fn install(&self, domain: &str, content: &str) -> Result<(), ManagerError> {
        let site = self.paths.site_file(domain);
        let link = self.paths.site_link(domain);
        let previous = site.read_optional().await?;
        let was_linked = tokio::fs::symlink_metadata(&link).await.is_ok();

        site.write_atomic(content.as_bytes()).await?;
        if let Err(e) = site.link_at(&link).await {
            warn!("Enabling the site for {} failed, restoring the previous configuration", domain);
            if let Err(restore) = restore_site(&site, &link, previous, was_linked).await {
                warn!("Restoring the site for {} failed: {}", domain, restore);
            }
            return Err(e);
        }

        let test = self.test().await?;
        if !test.ok {
            warn!("nginx rejected the configuration for {}, restoring the previous one", domain);
            restore_site(&site, &link, previous, was_linked).await?;
            return Err(ManagerError::ConfigInvalid {
                domain: domain.to_string(),
                output: test.output,
            });
        }

        self.reload().await?;
        info!("nginx configuration installed for {}", domain);
        Ok(())
    }

    /// Disable and delete a site, then reload
    pub async fn remove(&self, domain: &str) -> Result<(), ManagerError> {
        remove_link(&self.paths.site_link(domain)).await?;
        self.paths.site_file(domain).delete().await?;
        self.reload().await?;
        info!("nginx configuration removed for {}", domain);
        Ok(())
    }

    /// Validate the whole nginx configuration
    pub async fn test(&self) -> Result<ConfigTest, ManagerError> {
        let output = self
            .runner
            .run(&CommandSpec::new("nginx -t").elevated().unchecked())
            .await?;
        Ok(ConfigTest {
            ok: output.success(),
            output: output.tail(),
        })
    }

    pub async fn reload(&self) -> Result<(), ManagerError> {
        self.runner
            .run(&CommandSpec::new("systemctl reload nginx").elevated())
            .await?;
        Ok(())
    }

    /// Validate, failing with `ConfigInvalid` if nginx rejects the configuration, then reload
    pub async fn test_and_reload(&self) -> Result<(), ManagerError> {
        let test = self.test().await?;
        if !test.ok {
            return Err(ManagerError::ConfigInvalid {
                domain: "*".to_string(),
                output: test.output,
            });
        }
        self.reload().await
    }

    /// Swap the site for a maintenance page
    pub async fn enter_maintenance(
        &self,
        record: &ApplicationRecord,
        page: MaintenancePage,
    ) -> Result<(), ManagerError> {
        self.install(&record.domain, &self.render_maintenance(record, page)).await
    }

    /// Put the regular site back
    pub async fn leave_maintenance(&self, record: &ApplicationRecord) -> Result<(), ManagerError> {
        self.install(&record.domain, &self.render(record)).await
    }

    pub async fn is_installed(&self, domain: &str) -> bool {
        self.paths.site_file(domain).exists().await
    }

    pub async fn is_enabled(&self, domain: &str) -> bool {
        tokio::fs::symlink_metadata(self.paths.site_link(domain)).await.is_ok()
    }

    /// Whether the installed site is a maintenance-mode configuration
    pub async fn is_in_maintenance(&self, domain: &str) -> Result<bool, ManagerError> {
        Ok(self
            .paths
            .site_file(domain)
            .read_optional()
            .await?
            .is_some_and(|content| content.starts_with(MAINTENANCE_HEADER)))
    }

    /// Whether the installed site routes errors to the maintenance pages
    pub async fn has_maintenance_routing(&self, domain: &str) -> Result<bool, ManagerError> {
        Ok(self
            .paths
            .site_file(domain)
            .read_optional()
            .await?
            .is_some_and(|content| content.contains(MAINTENANCE_MARKER)))
    }

    fn server_block(&self, record: &ApplicationRecord, body: &str) -> String {
        let maintenance_root = self.paths.maintenance_dir.display();
        let errors = format!(
            r#"
    {marker}
    error_page 500 /maintenance.html;
    location = /error502.html {{
        root {root};
        internal;
    }}
    location = /maintenance.html {{
        root {root};
        internal;
    }}

    location /nginx-health {{
        access_log off;
        default_type text/plain;
        return 200 "nginx healthy\n";
    }}

    location ~ /\.(?!well-known) {{
        deny all;
        access_log off;
        log_not_found off;
    }}

    client_max_body_size 100M;
"#,
            marker = MAINTENANCE_MARKER,
            root = maintenance_root
        );
        self.bare_server_block(record, &format!("{}{}", body, errors))
    }

    fn bare_server_block(&self, record: &ApplicationRecord, body: &str) -> String {
        let listen = if record.ssl {
            let certs = self.paths.cert_dir(&record.domain);
            format!(
                r#"    listen 443 ssl;
    listen [::]:443 ssl;
    ssl_certificate {certs}/fullchain.pem;
    ssl_certificate_key {certs}/privkey.pem;
    include {le}/options-ssl-nginx.conf;
    ssl_dhparam {le}/ssl-dhparams.pem;
"#,
                certs = certs.display(),
                le = self.paths.letsencrypt_dir.display()
            )
        } else {
            "    listen 80;\n    listen [::]:80;\n".to_string()
        };

        let server = format!(
            r#"server {{
{listen}    server_name {domain};

    access_log {access} combined;
    error_log {error} warn;

    add_header X-Content-Type-Options "nosniff" always;
    add_header X-Frame-Options "SAMEORIGIN" always;
{body}}}
"#,
            listen = listen,
            domain = record.domain,
            access = self.paths.access_log(&record.domain).display(),
            error = self.paths.error_log(&record.domain).display(),
            body = body
        );

        if !record.ssl {
            return server;
        }
        format!(
            r#"server {{
    listen 80;
    listen [::]:80;
    server_name {domain};
    return 301 https://$host$request_uri;
}}

{server}"#,
            domain = record.domain,
            server = server
        )
    }

    fn proxy_location(&self, path: &str, port: u16, buffer_size: &str, buffers: &str) -> String {
        format!(
            r#"
    location {path} {{
        proxy_pass http://127.0.0.1:{port};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_set_header X-Forwarded-Host $host;
        proxy_cache_bypass $http_upgrade;

        proxy_buffering on;
        proxy_buffer_size {buffer_size};
        proxy_buffers {buffers};

        proxy_connect_timeout 30s;
        proxy_send_timeout 60s;
        proxy_read_timeout 60s;
    }}
"#
        )
    }

    fn passthrough(&self, path: &str, port: u16) -> String {
        format!(
            r#"
    location {path} {{
        proxy_pass http://127.0.0.1:{port}{path};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }}
"#
        )
    }

    fn static_locations(&self, record: &ApplicationRecord) -> String {
        let root = record
            .document_root
            .as_ref()
            .unwrap_or(&record.working_dir)
            .display()
            .to_string();
        format!(
            r#"
    root {root};
    index index.html index.htm;

    location / {{
        try_files $uri $uri/ =404;
    }}

    location ~* \.(js|css|png|jpg|jpeg|gif|ico|svg|webp|woff|woff2|ttf|eot)$ {{
        expires 1y;
        add_header Cache-Control "public, immutable";
        access_log off;
    }}
"#
        )
    }
}

/// Put a site back the way it was before an install
async fn restore_site(
    site: &File,
    link: &Path,
    previous: Option<String>,
    was_linked: bool,
) -> Result<(), ManagerError> {
    match previous {
        Some(old) => {
            site.write_atomic(old.as_bytes()).await?;
            if !was_linked {
                remove_link(link).await?;
            }
        }
        None => {
            site.delete().await?;
            remove_link(link).await?;
        }
    }
    Ok(())
}
