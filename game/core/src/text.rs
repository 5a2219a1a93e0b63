use hashbrown::HashMap;
use lazy_static::lazy_static;

/// The languages the game is localised for, resolved from the ASCII codes
/// the server reports. Unknown codes fall back to English.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Language {
    English,
    Esperanto,
    French,
    EnglishShavian,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Text {
    PlayerJoined,
    PlayerLeft,
    BadGame,
    GameFull,
}

lazy_static! {
    static ref LANGUAGE_BY_CODE: HashMap<&'static str, Language> = {
        let mut map = HashMap::new();
        map.insert("en", Language::English);
        map.insert("eo", Language::Esperanto);
        map.insert("fr", Language::French);
        map.insert("en-sv", Language::EnglishShavian);
        map
    };
}

impl Language {
    #[inline]
    pub fn from_code(code: &str) -> Language {
        LANGUAGE_BY_CODE.get(code).copied().unwrap_or(Language::English)
    }

    #[inline]
    pub fn code(self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Esperanto => "eo",
            Language::French => "fr",
            Language::EnglishShavian => "en-sv",
        }
    }
}

/// Looks up a localised string. Player-note templates carry a `{}`
/// placeholder for the player name.
pub fn get(language: Language, text: Text) -> &'static str {
    match language {
        Language::English => match text {
            Text::PlayerJoined => "{} joined the game",
            Text::PlayerLeft => "{} left the game",
            Text::BadGame => {
                "This game is no longer available. Please start a new one instead."
            }
            Text::GameFull => "This game is full. Please start a new one instead.",
        },
        Language::Esperanto => match text {
            Text::PlayerJoined => "{} aliĝis al la ludo",
            Text::PlayerLeft => "{} forlasis la ludon",
            Text::BadGame => {
                "Ĉi tiu ludo ne plu disponeblas. Bonvolu anstataŭe komenci novan."
            }
            Text::GameFull => "Ĉi tiu ludo estas plena. Bonvolu anstataŭe komenci novan.",
        },
        Language::French => match text {
            Text::PlayerJoined => "{} a rejoint la partie",
            Text::PlayerLeft => "{} a quitté la partie",
            Text::BadGame => {
                "Cette partie n’est plus disponible. Veuillez en commencer une nouvelle."
            }
            Text::GameFull => "Cette partie est complète. Veuillez en commencer une nouvelle.",
        },
        Language::EnglishShavian => match text {
            Text::PlayerJoined => "{} 𐑡𐑶𐑯𐑛 𐑞 𐑜𐑱𐑥",
            Text::PlayerLeft => "{} 𐑤𐑧𐑓𐑑 𐑞 𐑜𐑱𐑥",
            Text::BadGame => {
                "𐑞𐑦𐑕 𐑜𐑱𐑥 𐑦𐑟 𐑯𐑴 𐑤𐑪𐑙𐑜𐑼 𐑩𐑝𐑱𐑤𐑩𐑚𐑩𐑤. 𐑐𐑤𐑰𐑟 𐑕𐑑𐑸𐑑 𐑩 𐑯𐑿 𐑢𐑳𐑯 𐑦𐑯𐑕𐑑𐑧𐑛."
            }
            Text::GameFull => "𐑞𐑦𐑕 𐑜𐑱𐑥 𐑦𐑟 𐑓𐑫𐑤. 𐑐𐑤𐑰𐑟 𐑕𐑑𐑸𐑑 𐑩 𐑯𐑿 𐑢𐑳𐑯 𐑦𐑯𐑕𐑑𐑧𐑛.",
        },
    }
}

/// Renders a player-note template with the player's name.
pub fn format_player_note(language: Language, text: Text, name: &str) -> String {
    get(language, text).replace("{}", name)
}
