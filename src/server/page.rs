const TEMPLATE: &str = include_str!("page.html");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tab {
    #[default]
    Download,
    Upload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub ok: bool,
    pub text: String,
}

impl Status {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            ok: true,
            text: text.into(),
        }
    }

    pub fn err(text: impl Into<String>) -> Self {
        Self {
            ok: false,
            text: text.into(),
        }
    }
}

/// What the control page shows: the active tab, the echoed form values and
/// the outcome of the last action.
#[derive(Debug, Clone)]
pub struct Page {
    pub tab: Tab,
    pub name: String,
    pub url: String,
    pub interval: String,
    pub status: Option<Status>,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            tab: Tab::Download,
            name: String::new(),
            url: String::new(),
            interval: "0".to_string(),
            status: None,
        }
    }
}

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

impl Page {
    pub fn render(&self) -> String {
        let checked = |t: Tab| if self.tab == t { "checked" } else { "" };
        let status = match &self.status {
            Some(s) => format!(
                "<p class=\"status {}\">{}</p>",
                if s.ok { "ok" } else { "err" },
                escape(&s.text)
            ),
            None => String::new(),
        };
        TEMPLATE
            .replace("{{DOWNLOAD_CHECKED}}", checked(Tab::Download))
            .replace("{{UPLOAD_CHECKED}}", checked(Tab::Upload))
            .replace("{{NAME}}", &escape(&self.name))
            .replace("{{URL}}", &escape(&self.url))
            .replace("{{INTERVAL}}", &escape(&self.interval))
            .replace("{{STATUS}}", &status)
    }
}
