//! Browser rendering for pages whose static HTML carries no readable text.
//!
//! One Node+Playwright child serves a whole run: the browser launches once,
//! then requests and replies travel as single JSON lines over stdin/stdout.
//! Calls are serialized through an async mutex (a headless browser is a
//! scarce resource; render volume is low because it is an escalation path,
//! not the primary fetch).
//!
//! Opt-in via `RAGPIPE_RENDER_ENABLE`; without it `from_env` fails with
//! `NotConfigured` and the pipeline simply skips escalation.

use ragpipe_core::{Error, Result};
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};

const DEFAULT_MAX_HTML_CHARS: usize = 2_000_000;
const LAUNCH_TIMEOUT_MS: u64 = 30_000;
const SHUTDOWN_GRACE_MS: u64 = 5_000;
/// Slack on top of the per-page timeout before the child is presumed hung.
const HARD_TIMEOUT_SLACK_MS: u64 = 10_000;

fn env_truthy(k: &str) -> bool {
    matches!(
        std::env::var(k)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn node_path_for_playwright() -> Option<String> {
    fn has_playwright(np: &str) -> bool {
        np.split(':')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .any(|p| std::path::Path::new(p).join("playwright").is_dir())
    }

    // Explicit override keeps the user's global NODE_PATH clean.
    if let Ok(v) = std::env::var("RAGPIPE_NODE_PATH") {
        let v = v.trim();
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }

    let existing = std::env::var("NODE_PATH").unwrap_or_default();
    if has_playwright(&existing) {
        return None;
    }

    let npm_root = || -> Option<String> {
        let out = std::process::Command::new("npm")
            .args(["root", "-g"])
            .output()
            .ok()?;
        if !out.status.success() {
            return None;
        }
        let s = String::from_utf8_lossy(&out.stdout).trim().to_string();
        (!s.is_empty() && std::path::Path::new(&s).join("playwright").is_dir()).then_some(s)
    };

    let candidates = [
        "/opt/homebrew/lib/node_modules",
        "/usr/local/lib/node_modules",
        "/usr/lib/node_modules",
    ];
    let found = npm_root().or_else(|| {
        candidates
            .iter()
            .find(|root| std::path::Path::new(root).join("playwright").is_dir())
            .map(|s| s.to_string())
    })?;

    if existing.trim().is_empty() {
        Some(found)
    } else {
        Some(format!("{existing}:{found}"))
    }
}

// Stdout is JSON lines only; the first line reports launch readiness, every
// later line answers exactly one request. Contexts are per-page so state
// never leaks between URLs; stdin EOF closes the browser and exits.
const JS: &str = r#"
const readline = require('readline');

function send(obj) { process.stdout.write(JSON.stringify(obj) + '\n'); }

async function main() {
  let pw;
  try { pw = require('playwright'); } catch (e) {
    send({ ready: false, error: 'Playwright is not installed for Node.js (require("playwright") failed). Install with `npm i -g playwright` and `npx playwright install chromium`.' });
    process.exit(1);
  }
  let browser;
  try { browser = await pw.chromium.launch({ headless: true }); }
  catch (e) { send({ ready: false, error: String(e && e.message ? e.message : e) }); process.exit(1); }
  send({ ready: true });

  const rl = readline.createInterface({ input: process.stdin, terminal: false });
  for await (const line of rl) {
    const s = String(line).trim();
    if (!s) continue;
    let req;
    try { req = JSON.parse(s); } catch (e) { send({ id: -1, ok: false, error: 'bad request json' }); continue; }
    const id = req.id;
    const url = String(req.url || '').trim();
    const timeoutMs = Number(req.timeout_ms || 20000);
    const t0 = Date.now();
    let context;
    let consoleErrorCount = 0;
    try {
      context = await browser.newContext({ serviceWorkers: 'block' });
      const page = await context.newPage();
      page.on('console', (m) => { if (m.type && m.type() === 'error') consoleErrorCount += 1; });
      try {
        await page.route('**/*', (route) => {
          const rt = route.request().resourceType();
          if (rt === 'image' || rt === 'media' || rt === 'font') return route.abort();
          return route.continue();
        });
      } catch (_) {}
      const resp = await page.goto(url, { waitUntil: 'domcontentloaded', timeout: timeoutMs });
      try { await page.waitForLoadState('networkidle', { timeout: Math.min(5000, timeoutMs) }); } catch (_) {}
      const html = await page.content();
      send({ id, ok: true, final_url: page.url(), status: resp ? resp.status() : null, html,
             elapsed_ms: Date.now() - t0, console_error_count: consoleErrorCount });
    } catch (e) {
      send({ id, ok: false, error: String(e && e.message ? e.message : e) });
    } finally {
      try { if (context) await context.close(); } catch (_) {}
    }
  }
  try { await browser.close(); } catch (_) {}
}

main().catch((e) => { send({ ready: false, error: String(e && e.message ? e.message : e) }); process.exit(1); });
"#;

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub final_url: String,
    pub status: Option<u16>,
    pub html: String,
    pub elapsed_ms: u64,
    pub console_error_count: u64,
}

#[derive(Debug, Deserialize)]
struct ReplyLine {
    ready: Option<bool>,
    id: Option<u64>,
    ok: Option<bool>,
    error: Option<String>,
    final_url: Option<String>,
    status: Option<u16>,
    html: Option<String>,
    elapsed_ms: Option<u64>,
    console_error_count: Option<u64>,
}

#[derive(Debug)]
struct SessionProc {
    child: Child,
    stdin: ChildStdin,
    stdout: tokio::io::Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl SessionProc {
    async fn spawn() -> Result<Self> {
        let node_bin = std::env::var("RAGPIPE_NODE").unwrap_or_else(|_| "node".to_string());
        let mut cmd = tokio::process::Command::new(node_bin);
        if let Some(node_path) = node_path_for_playwright() {
            cmd.env("NODE_PATH", node_path);
        }
        let mut child = cmd
            .arg("-e")
            .arg(JS)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::NotConfigured(format!(
                    "render requires Node.js (`node`) and the Playwright npm package: {e}"
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Fetch("render session: missing stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Fetch("render session: missing stdout pipe".to_string()))?;
        let mut stdout = BufReader::new(stdout).lines();

        // Browser launch happens before the first request is accepted.
        let ready =
            tokio::time::timeout(Duration::from_millis(LAUNCH_TIMEOUT_MS), stdout.next_line())
                .await;
        let line = match ready {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) | Ok(Err(_)) => {
                let _ = child.kill().await;
                return Err(Error::NotConfigured(
                    "render session exited before becoming ready".to_string(),
                ));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(Error::Timeout(format!(
                    "render session not ready after {LAUNCH_TIMEOUT_MS}ms"
                )));
            }
        };
        let parsed: ReplyLine = serde_json::from_str(line.trim())
            .map_err(|e| Error::Fetch(format!("render session sent invalid JSON: {e}")))?;
        if parsed.ready != Some(true) {
            let _ = child.kill().await;
            return Err(Error::NotConfigured(format!(
                "render session failed to start: {}",
                parsed.error.unwrap_or_else(|| "unknown".to_string())
            )));
        }

        Ok(Self {
            child,
            stdin,
            stdout,
            next_id: 1,
        })
    }

    async fn request(&mut self, url: &str, timeout_ms: u64) -> Result<ReplyLine> {
        let id = self.next_id;
        self.next_id += 1;
        let line = serde_json::json!({ "id": id, "url": url, "timeout_ms": timeout_ms });
        let mut buf = line.to_string();
        buf.push('\n');
        self.stdin
            .write_all(buf.as_bytes())
            .await
            .map_err(|e| Error::Fetch(format!("render session write failed: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| Error::Fetch(format!("render session write failed: {e}")))?;

        // Calls are serialized, so the next matching line is ours. Skip a
        // bounded number of stragglers from an earlier timed-out request.
        for _ in 0..5 {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|e| Error::Fetch(format!("render session read failed: {e}")))?
                .ok_or_else(|| Error::Fetch("render session closed stdout".to_string()))?;
            let parsed: ReplyLine = match serde_json::from_str(line.trim()) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if parsed.id == Some(id) {
                return Ok(parsed);
            }
        }
        Err(Error::Fetch(
            "render session replies out of sync".to_string(),
        ))
    }

    async fn terminate(mut self) {
        // Dropping stdin signals EOF; the script closes the browser itself.
        drop(self.stdin);
        if tokio::time::timeout(Duration::from_millis(SHUTDOWN_GRACE_MS), self.child.wait())
            .await
            .is_err()
        {
            let _ = self.child.kill().await;
            let _ = self.child.wait().await;
        }
    }
}

#[derive(Debug)]
pub struct RenderSession {
    proc: tokio::sync::Mutex<Option<SessionProc>>,
    max_html_chars: usize,
}

impl RenderSession {
    pub fn from_env() -> Result<Self> {
        if !env_truthy("RAGPIPE_RENDER_ENABLE") {
            return Err(Error::NotConfigured(
                "RAGPIPE_RENDER_ENABLE is not set (or false)".to_string(),
            ));
        }
        let max_html_chars = std::env::var("RAGPIPE_RENDER_MAX_HTML_CHARS")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_HTML_CHARS);
        Ok(Self {
            proc: tokio::sync::Mutex::new(None),
            max_html_chars,
        })
    }

    /// Render one page. The child is spawned on first use; a child that
    /// hangs or dies is killed and cleared so the next call starts fresh.
    pub async fn render(&self, url: &str, timeout_ms: u64) -> Result<RenderedPage> {
        let mut guard = self.proc.lock().await;
        if guard.is_none() {
            *guard = Some(SessionProc::spawn().await?);
        }
        let proc = match guard.as_mut() {
            Some(p) => p,
            None => return Err(Error::Fetch("render session unavailable".to_string())),
        };

        let hard_ms = timeout_ms.saturating_add(HARD_TIMEOUT_SLACK_MS);
        let reply =
            match tokio::time::timeout(Duration::from_millis(hard_ms), proc.request(url, timeout_ms))
                .await
            {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    if let Some(p) = guard.take() {
                        p.terminate().await;
                    }
                    return Err(e);
                }
                Err(_) => {
                    if let Some(p) = guard.take() {
                        p.terminate().await;
                    }
                    return Err(Error::Timeout(format!(
                        "render hard timeout after {hard_ms}ms"
                    )));
                }
            };

        if reply.ok != Some(true) {
            return Err(Error::Fetch(format!(
                "render failed: {}",
                reply.error.unwrap_or_else(|| "unknown".to_string())
            )));
        }
        let html = reply.html.unwrap_or_default();
        if html.trim().is_empty() {
            return Err(Error::Fetch("render returned empty HTML".to_string()));
        }
        if html.len() > self.max_html_chars {
            return Err(Error::Fetch(format!(
                "render HTML too large ({} chars > {})",
                html.len(),
                self.max_html_chars
            )));
        }

        Ok(RenderedPage {
            final_url: reply.final_url.unwrap_or_else(|| url.to_string()),
            status: reply.status,
            html,
            elapsed_ms: reply.elapsed_ms.unwrap_or(0),
            console_error_count: reply.console_error_count.unwrap_or(0),
        })
    }

    /// Idempotent; safe to call whether or not a child was ever spawned.
    pub async fn shutdown(&self) {
        let mut guard = self.proc.lock().await;
        if let Some(p) = guard.take() {
            p.terminate().await;
        }
    }
}
