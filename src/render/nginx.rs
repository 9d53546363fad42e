//! Nginx configuration rendering.
//!
//! A site is described by [`NginxSite`]: the names it answers to, what it
//! serves ([`SiteKind`]) and optionally the TLS certificate it already has.
//! Rendering is pure string building; applying the result to a host lives in
//! `deploy::site`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// What a server block serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteKind {
    /// Files from a document root.
    Static { root: PathBuf },
    /// Reverse proxy to a local port, optionally aliasing `/static/`.
    Proxy {
        port: u16,
        static_dir: Option<PathBuf>,
    },
    /// Next.js app: proxy plus direct serving of build assets.
    NextJs { port: u16, app_dir: PathBuf },
}

/// Paths to an issued certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsCert {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

impl TlsCert {
    /// Let's Encrypt live paths for `domain`.
    pub fn letsencrypt(domain: &str) -> Self {
        let base = Path::new("/etc/letsencrypt/live").join(domain);
        Self {
            certificate: base.join("fullchain.pem"),
            key: base.join("privkey.pem"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NginxSite {
    pub server_names: Vec<String>,
    pub kind: SiteKind,
    pub tls: Option<TlsCert>,
}

const SECURITY_HEADERS: &str = r#"    add_header X-Frame-Options "SAMEORIGIN" always;
    add_header X-Content-Type-Options "nosniff" always;
    add_header X-XSS-Protection "1; mode=block" always;
    add_header Referrer-Policy "strict-origin-when-cross-origin" always;
"#;

const PROXY_HEADERS: &str = r#"        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection 'upgrade';
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_cache_bypass $http_upgrade;
        proxy_connect_timeout 60s;
        proxy_send_timeout 60s;
"#;

impl NginxSite {
    pub fn new(server_names: Vec<String>, kind: SiteKind) -> Self {
        Self {
            server_names,
            kind,
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: Option<TlsCert>) -> Self {
        self.tls = tls;
        self
    }

    /// The first server name; used for file names and comments.
    pub fn primary_name(&self) -> &str {
        self.server_names.first().map(String::as_str).unwrap_or("_")
    }

    pub fn render(&self) -> String {
        let names = self.server_names.join(" ");
        let mut out = String::new();
        let label = match self.kind {
            SiteKind::Static { .. } => "Static site",
            SiteKind::Proxy { .. } => "Reverse proxy",
            SiteKind::NextJs { .. } => "Next.js application",
        };
        let _ = writeln!(out, "# {} configuration for {}", label, self.primary_name());

        if self.tls.is_some() {
            let _ = writeln!(out, "server {{");
            let _ = writeln!(out, "    listen 80;");
            let _ = writeln!(out, "    server_name {};", names);
            let _ = writeln!(out, "    return 301 https://$host$request_uri;");
            let _ = writeln!(out, "}}\n");
        }

        let _ = writeln!(out, "server {{");
        match &self.tls {
            Some(cert) => {
                let _ = writeln!(out, "    listen 443 ssl http2;");
                let _ = writeln!(out, "    server_name {};", names);
                let _ = writeln!(out, "    ssl_certificate {};", cert.certificate.display());
                let _ = writeln!(out, "    ssl_certificate_key {};", cert.key.display());
            }
            None => {
                let _ = writeln!(out, "    listen 80;");
                let _ = writeln!(out, "    server_name {};", names);
            }
        }

        match &self.kind {
            SiteKind::Static { root } => render_static_body(&mut out, root),
            SiteKind::Proxy { port, static_dir } => {
                render_proxy_body(&mut out, *port, static_dir.as_deref())
            }
            SiteKind::NextJs { port, app_dir } => render_nextjs_body(&mut out, *port, app_dir),
        }
        out.push_str("}\n");
        out
    }
}

fn render_static_body(out: &mut String, root: &Path) {
    let _ = writeln!(out, "    root {};", root.display());
    out.push_str("    index index.html index.htm;\n\n");
    out.push_str("    # Security headers\n");
    out.push_str(SECURITY_HEADERS);
    out.push_str(
        r#"
    location / {
        try_files $uri $uri/ =404;
        expires 1h;
        add_header Cache-Control "public, no-transform";
    }

    # Long-term caching for static assets
    location ~* \.(css|js|png|jpg|jpeg|gif|ico|svg|woff|woff2|ttf|eot|webp|avif)$ {
        expires 1y;
        add_header Cache-Control "public, immutable";
        add_header Vary Accept-Encoding;
    }

    location ~* \.(css|js|html|xml|txt|json)$ {
        gzip on;
        gzip_vary on;
        gzip_min_length 1024;
        gzip_comp_level 6;
        gzip_types text/plain text/css text/xml text/javascript application/javascript application/xml+rss application/json;
    }

    # Hidden files
    location ~ /\. {
        deny all;
        access_log off;
        log_not_found off;
    }

    # Backup files
    location ~* \.(bak|backup|old|tmp)$ {
        deny all;
        access_log off;
        log_not_found off;
    }
"#,
    );
}

fn render_proxy_body(out: &mut String, port: u16, static_dir: Option<&Path>) {
    out.push_str("\n    # Security headers\n");
    out.push_str(SECURITY_HEADERS);
    out.push_str("\n    location / {\n");
    let _ = writeln!(out, "        proxy_pass http://localhost:{};", port);
    out.push_str(PROXY_HEADERS);
    out.push_str(
        r#"        proxy_read_timeout 86400;

        proxy_buffering on;
        proxy_buffer_size 8k;
        proxy_buffers 8 8k;
    }

    location /health {
        access_log off;
        return 200 "healthy\n";
        add_header Content-Type text/plain;
    }
"#,
    );
    if let Some(dir) = static_dir {
        out.push_str("\n    location /static/ {\n");
        let _ = writeln!(out, "        alias {}/;", dir.display());
        out.push_str("        expires 1y;\n");
        out.push_str("        add_header Cache-Control \"public, immutable\";\n");
        out.push_str("    }\n");
    }
}

fn render_nextjs_body(out: &mut String, port: u16, app_dir: &Path) {
    out.push_str("\n    # Security headers\n");
    out.push_str(SECURITY_HEADERS);
    out.push_str(
        r#"
    gzip on;
    gzip_vary on;
    gzip_min_length 1024;
    gzip_proxied expired no-cache no-store private auth;
    gzip_types text/plain text/css text/xml text/javascript application/javascript application/xml+rss application/json;

    location /_next/static/ {
"#,
    );
    let _ = writeln!(out, "        alias {}/.next/static/;", app_dir.display());
    out.push_str(
        r#"        expires 365d;
        add_header Cache-Control "public, immutable";
    }

    location /static/ {
"#,
    );
    let _ = writeln!(out, "        alias {}/public/;", app_dir.display());
    out.push_str(
        r#"        expires 365d;
        add_header Cache-Control "public, immutable";
    }

    location / {
"#,
    );
    let _ = writeln!(out, "        proxy_pass http://localhost:{};", port);
    out.push_str(PROXY_HEADERS);
    out.push_str("        proxy_read_timeout 60s;\n    }\n");
}

/// Tuned main `nginx.conf` installed during provisioning.
pub fn render_main_config(user: &str) -> String {
    format!(
        r#"user {user};
worker_processes auto;
pid /run/nginx.pid;
include /etc/nginx/modules-enabled/*.conf;

events {{
    worker_connections 768;
    multi_accept on;
    use epoll;
}}

http {{
    sendfile on;
    tcp_nopush on;
    tcp_nodelay on;
    keepalive_timeout 65;
    types_hash_max_size 2048;
    client_max_body_size 50M;

    include /etc/nginx/mime.types;
    default_type application/octet-stream;

    ssl_protocols TLSv1.2 TLSv1.3;
    ssl_prefer_server_ciphers on;

    log_format main '$remote_addr - $remote_user [$time_local] "$request" '
                    '$status $body_bytes_sent "$http_referer" '
                    '"$http_user_agent" "$http_x_forwarded_for"';

    access_log /var/log/nginx/access.log main;
    error_log /var/log/nginx/error.log;

    gzip on;
    gzip_vary on;
    gzip_proxied any;
    gzip_comp_level 6;
    gzip_types
        text/plain
        text/css
        text/xml
        text/javascript
        application/json
        application/javascript
        application/xml+rss
        application/atom+xml
        image/svg+xml;

    include /etc/nginx/conf.d/*.conf;
    include /etc/nginx/sites-enabled/*;
}}
"#
    )
}
