//! Renders the nginx reverse-proxy configuration from the app registry
//! plus the selected environment record.
//!
//! Rendering is a pure function of its inputs and the TLS mode: it never
//! touches the filesystem, and its output is deterministic (apps are
//! emitted in name order, hostnames in first-seen order) so diffs
//! against the applied file stay meaningful.

use crate::error::ConfigError;
use crate::registry::{AppRegistry, AppRow, EnvironmentRecord};
use similar::TextDiff;
use std::fmt::Write;
use std::path::PathBuf;

/// Conventional name of the generated file under `proxy_config_root`.
pub const CONF_FILE_NAME: &str = "nginx.conf";

/// Number of unchanged context lines around each diff hunk.
const DIFF_CONTEXT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    #[default]
    Plain,
    Tls,
}

/// Where the live config file for this environment lives.
pub fn conf_path(env: &EnvironmentRecord) -> PathBuf {
    env.proxy_config_root.join(CONF_FILE_NAME)
}

/// TLS certificate and key paths: the environment's own when both are
/// set, otherwise derived from the primary hostname under `~/ssl/`.
pub fn tls_paths(env: &EnvironmentRecord, server_names: &[String]) -> (PathBuf, PathBuf) {
    if let (Some(cert), Some(key)) = (&env.tls_cert_file, &env.tls_key_file) {
        return (cert.clone(), key.clone());
    }
    let cn = server_names
        .first()
        .map(String::as_str)
        .unwrap_or("localhost");
    let home = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."));
    (
        home.join("ssl").join("certs").join(format!("{}.crt", cn)),
        home.join("ssl").join("private").join(format!("{}.key", cn)),
    )
}

/// Render the complete configuration document.
///
/// The one fatal path: a registry carrying more than one `sso_issuer`
/// app aborts rendering with `ConfigError::MultipleSsoIssuers` before
/// any text is produced. Missing TLS files are not checked here; their
/// paths are emitted literally and only surface at validation time.
pub fn render(
    registry: &AppRegistry,
    env: &EnvironmentRecord,
    mode: TlsMode,
) -> Result<String, ConfigError> {
    registry.validate()?;

    let apps = registry.active_rows();
    let sso = apps.iter().find(|app| app.sso_issuer).cloned();
    let names = env.server_names();
    let names_line = names.join(" ");

    let mut out = String::new();
    out.push_str(
        "# ===============================================\n\
         # nginx.conf (AUTO-GENERATED, do not edit manually)\n\
         # Generated from the app registry and environment settings\n\
         # ===============================================\n\n",
    );

    if let Some(user) = &env.process_owner_user {
        let _ = writeln!(out, "user {};", user);
    }
    out.push_str("worker_processes auto;\n\n");
    out.push_str("events {\n    worker_connections 1024;\n}\n\n");

    out.push_str("http {\n");
    out.push_str(&http_common_block());

    match mode {
        TlsMode::Plain => {
            out.push_str(&plain_server_block(&names_line, env, &apps, sso.as_ref()));
        }
        TlsMode::Tls => {
            let (cert, key) = tls_paths(env, &names);
            out.push_str(&redirect_server_block(&names_line));
            out.push_str(&tls_server_block(
                &names_line,
                &cert,
                &key,
                env,
                &apps,
                sso.as_ref(),
            ));
        }
    }

    out.push_str("}\n");
    Ok(collapse_blank_lines(&out))
}

/// Global directives shared by both modes: compression, keepalive and
/// body-size tunables, WebSocket upgrade map, common proxy headers.
fn http_common_block() -> String {
    let mut b = String::new();
    b.push_str("    include       mime.types;\n");
    b.push_str("    default_type  application/octet-stream;\n\n");

    b.push_str("    map $http_upgrade $connection_upgrade {\n");
    b.push_str("        default upgrade;\n");
    b.push_str("        ''      close;\n");
    b.push_str("    }\n\n");

    b.push_str("    gzip on;\n");
    b.push_str("    gzip_types text/plain text/css application/javascript application/json application/xml text/xml;\n");
    b.push_str("    gzip_min_length 1024;\n");
    b.push_str("    gzip_vary on;\n");
    b.push_str("    gzip_proxied any;\n\n");

    b.push_str("    sendfile on;\n");
    b.push_str("    keepalive_timeout 65;\n\n");

    b.push_str("    absolute_redirect off;\n");
    b.push_str("    server_tokens off;\n\n");

    b.push_str("    client_max_body_size 200m;\n\n");

    b.push_str("    proxy_http_version 1.1;\n");
    b.push_str("    proxy_set_header   Host              $host;\n");
    b.push_str("    proxy_set_header   X-Real-IP         $remote_addr;\n");
    b.push_str("    proxy_set_header   X-Forwarded-For   $proxy_add_x_forwarded_for;\n");
    b.push_str("    proxy_set_header   X-Forwarded-Proto $scheme;\n");
    b.push_str("    proxy_set_header   X-Forwarded-Host  $host;\n");
    b.push_str("    proxy_set_header   X-Forwarded-Port  $server_port;\n");
    b.push_str("    proxy_redirect     off;\n");
    b.push_str("    proxy_read_timeout 86400;\n\n");
    b
}

/// The plain-HTTP server: static portal at the root with the
/// maintenance-flag escape hatch, then one location pair per app.
fn plain_server_block(
    names_line: &str,
    env: &EnvironmentRecord,
    apps: &[AppRow],
    sso: Option<&AppRow>,
) -> String {
    let mut b = String::new();
    b.push_str("    server {\n");
    b.push_str("        listen 80;\n");
    let _ = writeln!(b, "        server_name {};", names_line);
    b.push('\n');
    b.push_str(&portal_block(env));
    b.push_str(&app_location_blocks(apps, sso));
    b.push_str(&error_page_block());
    b.push_str("    }\n");
    b
}

/// HTTP-to-HTTPS redirect, emitted only in TLS mode.
fn redirect_server_block(names_line: &str) -> String {
    let mut b = String::new();
    b.push_str("    server {\n");
    b.push_str("        listen 80;\n");
    let _ = writeln!(b, "        server_name {};", names_line);
    b.push_str("        return 301 https://$host$request_uri;\n");
    b.push_str("    }\n\n");
    b
}

fn tls_server_block(
    names_line: &str,
    cert: &std::path::Path,
    key: &std::path::Path,
    env: &EnvironmentRecord,
    apps: &[AppRow],
    sso: Option<&AppRow>,
) -> String {
    let mut b = String::new();
    b.push_str("    server {\n");
    b.push_str("        listen 443 ssl;\n");
    b.push_str("        http2 on;\n");
    let _ = writeln!(b, "        server_name {};", names_line);
    b.push('\n');
    let _ = writeln!(b, "        ssl_certificate     {};", cert.display());
    let _ = writeln!(b, "        ssl_certificate_key {};", key.display());
    b.push_str("        ssl_protocols TLSv1.2 TLSv1.3;\n");
    b.push_str("        ssl_prefer_server_ciphers on;\n\n");

    // With an SSO issuer the document root routes to it; otherwise the
    // static portal serves the top level as in plain mode.
    match sso {
        Some(app) if app.base != "/" => b.push_str(&sso_root_route_block(app)),
        _ => b.push_str(&portal_block(env)),
    }

    b.push_str(&app_location_blocks(apps, sso));
    b.push_str(&error_page_block());
    b.push_str("    }\n");
    b
}

/// Static portal at the document root, with the maintenance-flag clause:
/// dropping `maintenance.flag` next to the portal page turns the whole
/// host into a 503 with `maintenance.html`.
fn portal_block(env: &EnvironmentRecord) -> String {
    let mut b = String::new();
    let _ = writeln!(b, "        root  {};", env.static_portal_root.display());
    b.push_str("        index index.html;\n\n");

    b.push_str("        if (-f $document_root/maintenance.flag) {\n");
    b.push_str("            return 503;\n");
    b.push_str("        }\n\n");

    b.push_str("        location / {\n");
    b.push_str("            try_files $uri $uri/ =404;\n");
    b.push_str("        }\n\n");

    b.push_str("        error_page 503 @maintenance;\n");
    b.push_str("        location @maintenance {\n");
    b.push_str("            rewrite ^(.*)$ /maintenance.html break;\n");
    b.push_str("        }\n\n");
    b
}

/// Route the document root to the SSO issuer so a hit on `/` lands on
/// the login flow.
fn sso_root_route_block(app: &AppRow) -> String {
    let mut b = String::new();
    b.push_str("        # route / to the SSO issuer\n");
    b.push_str("        location / {\n");
    let _ = writeln!(b, "            proxy_pass         http://127.0.0.1:{};", app.port);
    b.push_str("            proxy_set_header   Upgrade $http_upgrade;\n");
    b.push_str("            proxy_set_header   Connection $connection_upgrade;\n");
    b.push_str("            proxy_buffering    off;\n");
    b.push_str("            proxy_pass_header  Set-Cookie;\n");
    b.push_str("        }\n\n");
    b
}

fn app_location_blocks(apps: &[AppRow], sso: Option<&AppRow>) -> String {
    let mut b = String::new();
    for app in apps {
        let is_sso = sso.map(|s| s.name == app.name).unwrap_or(false);
        b.push_str(&app_location_block(app, is_sso));
        b.push('\n');
    }
    b
}

/// The per-app location pair: a bare-path redirect onto the trailing
/// slash, then the proxy location with WebSocket upgrade headers and
/// buffering off. Only the SSO issuer gets the cookie-path rewrite that
/// re-anchors its session cookie to the document root.
fn app_location_block(app: &AppRow, is_sso: bool) -> String {
    let mut b = String::new();
    let _ = writeln!(b, "        # {} (app on :{})", app.title, app.port);
    if app.base == "/" {
        b.push_str("        location / {\n");
    } else {
        let _ = writeln!(
            b,
            "        location = {} {{ return 301 {}/; }}",
            app.base, app.base
        );
        let _ = writeln!(b, "        location {}/ {{", app.base);
    }
    let _ = writeln!(b, "            proxy_pass         http://127.0.0.1:{};", app.port);
    b.push_str("            proxy_set_header   Upgrade $http_upgrade;\n");
    b.push_str("            proxy_set_header   Connection $connection_upgrade;\n");
    b.push_str("            proxy_buffering    off;\n");
    if is_sso && app.base != "/" {
        b.push_str("            proxy_pass_header  Set-Cookie;\n");
        let _ = writeln!(b, "            proxy_cookie_path  {}/ /;", app.base);
        let _ = writeln!(b, "            proxy_cookie_path  {}  /;", app.base);
    }
    b.push_str("        }\n");
    b
}

fn error_page_block() -> String {
    let mut b = String::new();
    b.push_str("        error_page 500 502 503 504 /50x.html;\n");
    b.push_str("        location = /50x.html {\n");
    b.push_str("            root /opt/homebrew/var/www/html;\n");
    b.push_str("        }\n");
    b
}

/// Strip trailing whitespace and collapse runs of blank lines to one.
fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Line-based unified diff with a small context window. An empty string
/// means "no differences".
pub fn unified_diff(current: &str, generated: &str) -> String {
    if current == generated {
        return String::new();
    }
    TextDiff::from_lines(current, generated)
        .unified_diff()
        .context_radius(DIFF_CONTEXT)
        .header("(current nginx.conf)", "(generated: dry-run)")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Settings;

    const REGISTRY: &str = r#"
[bot]
port = 8502
enabled = true

[auth]
port = 8591
enabled = true
base = "/auth"
sso_issuer = true

[off]
port = 9000
enabled = false
"#;

    const SETTINGS: &str = r#"
[env]
current = "home"

[locations.home]
project_root = "/srv/projects"
proxy_config_root = "/opt/homebrew/etc/nginx"
public_hostnames = ["home.local", "localhost"]
static_portal_root = "/srv/portal"
"#;

    fn fixture() -> (AppRegistry, EnvironmentRecord) {
        let registry = AppRegistry::from_toml_str(REGISTRY).unwrap();
        let settings = Settings::from_toml_str(SETTINGS).unwrap();
        let (_, record) = settings.select().unwrap();
        (registry, record.clone())
    }

    #[test]
    fn renders_server_names_and_location_pairs() {
        let (registry, env) = fixture();
        let text = render(&registry, &env, TlsMode::Plain).unwrap();

        assert!(text.contains("server_name home.local localhost;"));
        assert!(text.contains("location = /bot { return 301 /bot/; }"));
        assert!(text.contains("location /bot/ {"));
        assert!(text.contains("proxy_pass         http://127.0.0.1:8502;"));
        assert!(text.contains("location = /auth { return 301 /auth/; }"));
        assert!(text.contains("location /auth/ {"));
    }

    #[test]
    fn only_the_sso_issuer_rewrites_cookie_scope() {
        let (registry, env) = fixture();
        let text = render(&registry, &env, TlsMode::Plain).unwrap();

        assert!(text.contains("proxy_cookie_path  /auth/ /;"));
        assert!(text.contains("proxy_cookie_path  /auth  /;"));
        // no other app block carries a cookie rewrite
        assert_eq!(text.matches("proxy_cookie_path").count(), 2);
        assert!(!text.contains("proxy_cookie_path  /bot"));
    }

    #[test]
    fn two_sso_issuers_abort_rendering() {
        let registry = AppRegistry::from_toml_str(
            "[a]\nport = 8001\nsso_issuer = true\n\n[b]\nport = 8002\nsso_issuer = true\n",
        )
        .unwrap();
        let (_, env) = fixture();
        assert!(matches!(
            render(&registry, &env, TlsMode::Plain),
            Err(ConfigError::MultipleSsoIssuers { .. })
        ));
    }

    #[test]
    fn disabled_and_portless_apps_are_excluded() {
        let (_, env) = fixture();
        let registry = AppRegistry::from_toml_str(
            "[on]\nport = 8502\n\n[off]\nport = 9000\nenabled = false\n\n[noport]\nenabled = true\n",
        )
        .unwrap();
        let text = render(&registry, &env, TlsMode::Plain).unwrap();
        assert!(text.contains("/on/"));
        assert!(!text.contains("/off"));
        assert!(!text.contains("/noport"));
        assert!(!text.contains(":9000"));
    }

    #[test]
    fn bare_base_is_normalized_in_the_output() {
        let (_, env) = fixture();
        let registry = AppRegistry::from_toml_str("[bot]\nport = 8502\nbase = \"bot\"\n").unwrap();
        let text = render(&registry, &env, TlsMode::Plain).unwrap();
        assert!(text.contains("location = /bot { return 301 /bot/; }"));
        assert!(text.contains("location /bot/ {"));
    }

    #[test]
    fn plain_mode_serves_the_static_portal() {
        let (registry, env) = fixture();
        let text = render(&registry, &env, TlsMode::Plain).unwrap();
        assert!(text.contains("root  /srv/portal;"));
        assert!(text.contains("index index.html;"));
        assert!(text.contains("maintenance.flag"));
        assert!(text.contains("listen 80;"));
        assert!(!text.contains("listen 443"));
        assert!(!text.contains("ssl_certificate"));
    }

    #[test]
    fn tls_mode_adds_redirect_and_ssl_server() {
        let (registry, env) = fixture();
        let text = render(&registry, &env, TlsMode::Tls).unwrap();

        assert!(text.contains("return 301 https://$host$request_uri;"));
        assert!(text.contains("listen 443 ssl;"));
        assert!(text.contains("http2 on;"));
        assert!(text.contains("ssl_protocols TLSv1.2 TLSv1.3;"));
        // derived from the primary hostname, environment sets no files
        assert!(text.contains("home.local.crt"));
        assert!(text.contains("home.local.key"));
        // the SSO issuer owns the document root
        assert!(text.contains("# route / to the SSO issuer"));
    }

    #[test]
    fn tls_mode_uses_configured_certificate_paths() {
        let (registry, _) = fixture();
        let text = SETTINGS.replace(
            "static_portal_root = \"/srv/portal\"",
            "static_portal_root = \"/srv/portal\"\ntls_cert_file = \"/etc/ssl/site.crt\"\ntls_key_file = \"/etc/ssl/site.key\"",
        );
        let settings = Settings::from_toml_str(&text).unwrap();
        let (_, env) = settings.select().unwrap();

        let rendered = render(&registry, env, TlsMode::Tls).unwrap();
        assert!(rendered.contains("ssl_certificate     /etc/ssl/site.crt;"));
        assert!(rendered.contains("ssl_certificate_key /etc/ssl/site.key;"));
    }

    #[test]
    fn tls_mode_without_sso_falls_back_to_the_portal() {
        let (_, env) = fixture();
        let registry = AppRegistry::from_toml_str("[bot]\nport = 8502\n").unwrap();
        let text = render(&registry, &env, TlsMode::Tls).unwrap();
        assert!(text.contains("root  /srv/portal;"));
        assert!(!text.contains("route / to the SSO issuer"));
    }

    #[test]
    fn user_directive_follows_the_environment() {
        let (registry, env) = fixture();
        let text = render(&registry, &env, TlsMode::Plain).unwrap();
        assert!(!text.contains("\nuser "));

        let with_user = SETTINGS.replace(
            "static_portal_root = \"/srv/portal\"",
            "static_portal_root = \"/srv/portal\"\nprocess_owner_user = \"ops\"",
        );
        let settings = Settings::from_toml_str(&with_user).unwrap();
        let (_, env) = settings.select().unwrap();
        let text = render(&registry, env, TlsMode::Plain).unwrap();
        assert!(text.contains("user ops;"));
    }

    #[test]
    fn output_is_deterministic_and_collapsed() {
        let (registry, env) = fixture();
        let first = render(&registry, &env, TlsMode::Tls).unwrap();
        let second = render(&registry, &env, TlsMode::Tls).unwrap();
        assert_eq!(first, second);
        assert!(!first.contains("\n\n\n"));
        assert!(!first.lines().any(|line| line.ends_with(' ')));
    }

    #[test]
    fn diff_is_empty_for_identical_text() {
        assert_eq!(unified_diff("a\nb\n", "a\nb\n"), "");
    }

    #[test]
    fn diff_marks_changed_lines() {
        let diff = unified_diff("a\nb\nc\n", "a\nx\nc\n");
        assert!(diff.contains("(current nginx.conf)"));
        assert!(diff.contains("(generated: dry-run)"));
        assert!(diff.contains("-b"));
        assert!(diff.contains("+x"));
        assert!(diff.contains("@@"));
    }

    #[test]
    fn conf_path_uses_the_conventional_filename() {
        let (_, env) = fixture();
        assert_eq!(
            conf_path(&env),
            PathBuf::from("/opt/homebrew/etc/nginx/nginx.conf")
        );
    }
}
