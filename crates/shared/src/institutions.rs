use url::Url;

pub const DEFAULT_INSTITUTION_ID: &str = "lpu";

const STANDARD_TEMPLATE: &str = "\
You are a {{ROLE}} for {{INSTITUTION_NAME}} ({{INSTITUTION_SHORT_NAME}}), helping students with admissions, programs, campus life and careers.

## Scope
- Only answer questions about {{INSTITUTION_NAME}} and general education topics.
- For anything else, politely explain that you can only help with {{INSTITUTION_SHORT_NAME}} related questions.

## Response format
- Greet the student by name when it is provided.
- Use the retrieved information and cite specifics from it.
- Tailor the answer to the student's profile when one is given.
- Close with a friendly line inviting more questions about {{INSTITUTION_SHORT_NAME}}.
- Never sign off with a name or placeholder.

Official website: {{WEBSITE}}
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Institution {
    pub id: &'static str,
    pub name: &'static str,
    pub short_name: &'static str,
    pub role: &'static str,
    pub website: &'static str,
    pub admissions_url: Option<&'static str>,
    pub programs_url: Option<&'static str>,
}

const INSTITUTIONS: &[Institution] = &[
    Institution {
        id: "lpu",
        name: "Lovely Professional University",
        short_name: "LPU",
        role: "Career Counselor",
        website: "https://www.lpu.in",
        admissions_url: Some("https://www.lpu.in/admission/"),
        programs_url: Some("https://www.lpu.in/programs/"),
    },
    Institution {
        id: "amity",
        name: "Amity University",
        short_name: "AU",
        role: "Academic Advisor",
        website: "https://www.amity.edu",
        admissions_url: None,
        programs_url: None,
    },
];

impl Institution {
    /// System instructions with every placeholder substituted.
    pub fn system_prompt(&self) -> String {
        let mut prompt = STANDARD_TEMPLATE
            .replace("{{ROLE}}", self.role)
            .replace("{{INSTITUTION_NAME}}", self.name)
            .replace("{{INSTITUTION_SHORT_NAME}}", self.short_name)
            .replace("{{WEBSITE}}", self.website);

        if let Some(admissions_url) = self.admissions_url {
            prompt.push_str(&format!("Admissions: {admissions_url}\n"));
        }
        if let Some(programs_url) = self.programs_url {
            prompt.push_str(&format!("Programs: {programs_url}\n"));
        }
        prompt
    }

    /// Website host without a leading `www.`.
    pub fn domain(&self) -> Option<String> {
        let parsed = Url::parse(self.website).ok()?;
        let host = parsed.host_str()?.to_ascii_lowercase();
        Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
    }

    /// True when `url` points at this institution's site or one of its subdomains.
    pub fn owns_url(&self, url: &str) -> bool {
        let Some(domain) = self.domain() else {
            return false;
        };
        let Some(host) = Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
        else {
            return false;
        };

        host == domain || host.ends_with(&format!(".{domain}"))
    }
}

pub fn institution(id: &str) -> Option<&'static Institution> {
    let normalized = id.trim().to_ascii_lowercase();
    INSTITUTIONS
        .iter()
        .find(|institution| institution.id == normalized)
}

pub fn institutions() -> &'static [Institution] {
    INSTITUTIONS
}

/// Resolves a requested id, falling back to `default_id` and then to the
/// built-in default when either is unknown.
pub fn resolve_institution(requested: Option<&str>, default_id: &str) -> &'static Institution {
    requested
        .and_then(institution)
        .or_else(|| institution(default_id))
        .unwrap_or(&INSTITUTIONS[0])
}
