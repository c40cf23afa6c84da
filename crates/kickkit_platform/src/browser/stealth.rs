#![forbid(unsafe_code)]

//! Launch flags and page patches that keep an automated Chromium from advertising itself.

/// Flags for every launch. The profile directory and DevTools port are added by the launcher.
pub fn launch_args(headless: bool) -> Vec<String> {
	let mut args: Vec<String> = [
		"--no-sandbox",
		"--disable-setuid-sandbox",
		"--disable-blink-features=AutomationControlled",
		"--disable-infobars",
		"--no-first-run",
		"--no-default-browser-check",
		"--disable-dev-shm-usage",
		"--lang=en-US,en",
		"--window-size=1366,768",
	]
	.iter()
	.map(|s| s.to_string())
	.collect();
	if headless {
		args.insert(0, "--headless=new".to_string());
	}
	args
}

/// Installed with `Page.addScriptToEvaluateOnNewDocument`, so it runs before any site script.
pub const DOCUMENT_START_SCRIPT: &str = r#"
(() => {
	Object.defineProperty(Navigator.prototype, 'webdriver', { get: () => undefined });
	Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
	if (navigator.plugins.length === 0) {
		Object.defineProperty(navigator, 'plugins', {
			get: () => [
				{ name: 'PDF Viewer', filename: 'internal-pdf-viewer' },
				{ name: 'Chrome PDF Viewer', filename: 'internal-pdf-viewer' },
			],
		});
	}
	if (!window.chrome) {
		window.chrome = { runtime: {}, app: { isInstalled: false } };
	}
	const query = window.navigator.permissions && window.navigator.permissions.query;
	if (query) {
		window.navigator.permissions.query = (p) =>
			p && p.name === 'notifications'
				? Promise.resolve({ state: Notification.permission })
				: query.call(window.navigator.permissions, p);
	}
})();
"#;

/// Drop the headless marker from a browser user agent.
pub fn sanitize_user_agent(ua: &str) -> String {
	ua.replace("HeadlessChrome", "Chrome")
}

/// Titles served by the anti-bot interstitial instead of the real page.
pub fn is_challenge_title(title: &str) -> bool {
	let t = title.trim().to_ascii_lowercase();
	t.starts_with("just a moment") || t.contains("attention required") || t.contains("access denied")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn headless_flag_first() {
		let args = launch_args(true);
		assert_eq!(args[0], "--headless=new");
		assert!(args.iter().any(|a| a == "--disable-blink-features=AutomationControlled"));
		assert!(!launch_args(false).iter().any(|a| a.starts_with("--headless")));
	}

	#[test]
	fn user_agent_loses_headless_marker() {
		let ua = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) HeadlessChrome/126.0.0.0 Safari/537.36";
		let clean = sanitize_user_agent(ua);
		assert!(!clean.contains("Headless"));
		assert!(clean.contains("Chrome/126.0.0.0"));
	}

	#[test]
	fn challenge_titles() {
		assert!(is_challenge_title("Just a moment..."));
		assert!(is_challenge_title("Attention Required! | Cloudflare"));
		assert!(!is_challenge_title("Kick"));
		assert!(!is_challenge_title(""));
	}
}
