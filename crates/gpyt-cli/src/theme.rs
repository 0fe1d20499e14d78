use ratatui::style::Color;

#[derive(Debug, Clone)]
pub struct Theme {
    pub name: &'static str,
    pub fg: Color,
    pub accent: Color,
    pub muted: Color,
    pub error: Color,
    pub warning: Color,
    pub user_color: Color,
    pub assistant_color: Color,
    pub notice_color: Color,
    pub code_fg: Color,
    pub selection: Color,
    pub border: Color,
}

impl Theme {
    pub fn dark() -> Self {
        Self {
            name: "dark",
            fg: Color::Rgb(220, 220, 220),
            accent: Color::Rgb(122, 162, 247),
            muted: Color::Rgb(100, 100, 100),
            error: Color::Rgb(247, 118, 142),
            warning: Color::Rgb(224, 175, 104),
            user_color: Color::Cyan,
            assistant_color: Color::Green,
            notice_color: Color::Yellow,
            code_fg: Color::Rgb(190, 190, 160),
            selection: Color::Rgb(55, 65, 95),
            border: Color::Rgb(60, 60, 60),
        }
    }

    /// Light background, for terminals where the dark palette washes out.
    pub fn light() -> Self {
        Self {
            name: "light",
            fg: Color::Rgb(40, 40, 40),
            accent: Color::Rgb(37, 99, 235),
            muted: Color::Rgb(130, 130, 130),
            error: Color::Rgb(200, 40, 60),
            warning: Color::Rgb(180, 110, 0),
            user_color: Color::Rgb(0, 110, 160),
            assistant_color: Color::Rgb(20, 120, 50),
            notice_color: Color::Rgb(150, 90, 0),
            code_fg: Color::Rgb(90, 60, 130),
            selection: Color::Rgb(210, 220, 245),
            border: Color::Rgb(190, 190, 190),
        }
    }

    pub fn dracula() -> Self {
        Self {
            name: "dracula",
            fg: Color::Rgb(248, 248, 242),
            accent: Color::Rgb(255, 121, 198),
            muted: Color::Rgb(98, 114, 164),
            error: Color::Rgb(255, 85, 85),
            warning: Color::Rgb(241, 250, 140),
            user_color: Color::Rgb(139, 233, 253),
            assistant_color: Color::Rgb(80, 250, 123),
            notice_color: Color::Rgb(241, 250, 140),
            code_fg: Color::Rgb(189, 147, 249),
            selection: Color::Rgb(68, 71, 90),
            border: Color::Rgb(68, 71, 90),
        }
    }

    /// Unknown names fall back to the dark theme.
    pub fn by_name(name: &str) -> Self {
        Self::find(name).unwrap_or_else(Self::dark)
    }

    pub fn find(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "dark" => Some(Self::dark()),
            "light" => Some(Self::light()),
            "dracula" => Some(Self::dracula()),
            _ => None,
        }
    }

    pub fn all_names() -> &'static [&'static str] {
        &["dark", "light", "dracula"]
    }
}
