/// The dialog the shell is currently presenting. The game starts in the
/// name-entry dialog because nothing can happen without a player name.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Dialog {
    None,
    Name,
    Menu,
    InviteLink,
    Language,
    Guide,
    Copyright,
}

impl Dialog {
    pub fn to_name(self) -> &'static str {
        match self {
            Dialog::None => "none",
            Dialog::Name => "name",
            Dialog::Menu => "menu",
            Dialog::InviteLink => "invite_link",
            Dialog::Language => "language",
            Dialog::Guide => "guide",
            Dialog::Copyright => "copyright",
        }
    }

    pub fn from_name(name: &str) -> Option<Dialog> {
        match name {
            "none" => Some(Dialog::None),
            "name" => Some(Dialog::Name),
            "menu" => Some(Dialog::Menu),
            "invite_link" => Some(Dialog::InviteLink),
            "language" => Some(Dialog::Language),
            "guide" => Some(Dialog::Guide),
            "copyright" => Some(Dialog::Copyright),
            _ => None,
        }
    }
}
