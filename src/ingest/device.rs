use serde::{Deserialize, Serialize};

const UNKNOWN: &str = "Unknown";

/// Form factor inferred from a user agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Desktop,
    Mobile,
    Tablet,
}

/// Browser, OS and form factor of the reporting client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub browser: String,
    pub os: String,
    pub device_type: DeviceType,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            browser: UNKNOWN.to_string(),
            os: UNKNOWN.to_string(),
            device_type: DeviceType::Desktop,
        }
    }
}

/// Token checks in priority order. Chromium derivatives advertise "Chrome"
/// and Chrome advertises "Safari", so the more specific tokens come first.
const BROWSERS: &[(&str, &str)] = &[
    ("Edg/", "Edge"),
    ("EdgA/", "Edge"),
    ("EdgiOS/", "Edge"),
    ("OPR/", "Opera"),
    ("Opera", "Opera"),
    ("SamsungBrowser/", "Samsung Internet"),
    ("YaBrowser/", "Yandex"),
    ("Firefox/", "Firefox"),
    ("FxiOS/", "Firefox"),
    ("CriOS/", "Chrome"),
    ("Chrome/", "Chrome"),
    ("Chromium/", "Chromium"),
    ("MSIE ", "IE"),
    ("Trident/", "IE"),
    ("Safari/", "Safari"),
];

const OPERATING_SYSTEMS: &[(&str, &str)] = &[
    ("Windows", "Windows"),
    ("Android", "Android"),
    ("iPhone", "iOS"),
    ("iPad", "iOS"),
    ("iPod", "iOS"),
    ("CrOS", "Chrome OS"),
    ("Mac OS X", "Mac OS"),
    ("Macintosh", "Mac OS"),
    ("Linux", "Linux"),
];

/// Parses a user-agent string. Unrecognised parts stay `"Unknown"`.
pub fn parse_user_agent(ua: &str) -> DeviceInfo {
    let ua = ua.trim();
    if ua.is_empty() {
        return DeviceInfo::default();
    }

    let browser = BROWSERS
        .iter()
        .find(|(token, _)| ua.contains(token))
        .map_or(UNKNOWN, |(_, name)| *name);

    let os = OPERATING_SYSTEMS
        .iter()
        .find(|(token, _)| ua.contains(token))
        .map_or(UNKNOWN, |(_, name)| *name);

    DeviceInfo {
        browser: browser.to_string(),
        os: os.to_string(),
        device_type: device_type(ua),
    }
}

fn device_type(ua: &str) -> DeviceType {
    if ua.contains("iPad") || ua.contains("Tablet") || (ua.contains("Android") && !ua.contains("Mobile")) {
        DeviceType::Tablet
    } else if ua.contains("Mobi") || ua.contains("iPhone") || ua.contains("iPod") {
        DeviceType::Mobile
    } else {
        DeviceType::Desktop
    }
}
