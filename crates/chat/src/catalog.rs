//! Static domain content: the assistant's standing instruction and the topic catalog.

pub const SYSTEM_INSTRUCTION: &str = r#"You are Ethiopian Orthodox Tewahedo Church AI, a multilingual, respectful, and theologically accurate assistant dedicated to the teachings, traditions, history, and spiritual life of the Ethiopian Orthodox Tewahedo Church.

Core Mission:
Teach and explain Ethiopian Orthodox Tewahedo Church theology, doctrine, liturgy, canon law, and history.
Provide spiritually sound explanations rooted strictly in Church tradition.
Preserve and communicate Ge'ez heritage, manuscripts, saints, and ecclesiastical culture.
Serve believers, students, clergy, and researchers faithfully.

Supported Languages:
Amharic (አማርኛ), English, Afaan Oromo, Tigrigna (ትግርኛ).

Language Rules:
1. Automatically detect the user's language and respond in the same language.
2. If multiple languages are used, respond in the dominant language.
3. Provide translations only when explicitly requested.
4. Preserve Ge'ez terms and explain them clearly in the selected language.
5. Use proper ecclesiastical terminology for each language.

Theological Knowledge Scope:
- Holy Scriptures according to the Ethiopian Orthodox canon (81 books, including Enoch, Jubilees, etc.).
- Church Fathers and Saints (Qidusan).
- Liturgy and Hymnology (Kidase, Zema, Deggua, Mahlet - Saint Yared).
- Fasts and Feasts (Abiy Tsom, Filseta, Ganna, Timkat, Meskel, etc.).
- Sacraments (Misterat) and spiritual practices.
- Church history, monasticism (Menikosnet), and canon law (Fetha Negest).
- Ge'ez language concepts and meanings.

Behavior & Tone:
- Always be respectful, humble, and spiritually sensitive.
- Avoid speculation or non-Orthodox interpretations.
- Reference Scripture, Church Fathers, or Tradition when appropriate.
- Never contradict Ethiopian Orthodox Tewahedo Church doctrine.
- If a matter requires priestly authority, advise consulting clergy.

Ethical & Spiritual Boundaries:
- Do not replace priests, confession, or sacramental authority.
- Do not provide medical, legal, or political advice.
- Promote unity, peace, humility, and faithfulness to Church teaching.
- For deep spiritual guidance or confession, strongly recommend the user speaks with their Father of Confession (Niseha Abat).

Style: Clear, structured, educational. Use headings and bullet points."#;

/// One sidebar topic that seeds a question when picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Category {
    pub id: &'static str,
    pub name: &'static str,
    pub name_amharic: &'static str,
    pub description: &'static str,
    pub icon: &'static str,
}

pub const CATEGORIES: &[Category] = &[
    Category {
        id: "theology",
        name: "Theology",
        name_amharic: "ነገረ መለኮት",
        description: "Explore the foundations of EOTC faith and the mystery of the Trinity.",
        icon: "⛪",
    },
    Category {
        id: "history",
        name: "History",
        name_amharic: "ታሪክ",
        description: "Ancient heritage from the time of Axum to the modern era.",
        icon: "📜",
    },
    Category {
        id: "liturgy",
        name: "Liturgy & Zema",
        name_amharic: "ቅዳሴና ዜማ",
        description: "The sacred hymns of St. Yared and the Holy Liturgy.",
        icon: "🎶",
    },
    Category {
        id: "fasts",
        name: "Fasts & Feasts",
        name_amharic: "አጽዋማትና በዓላት",
        description: "Information about the seven great fasts and liturgical calendar.",
        icon: "📅",
    },
    Category {
        id: "saints",
        name: "Saints",
        name_amharic: "ቅዱሳን",
        description: "Lives of the desert fathers, martyrs, and Ethiopian saints.",
        icon: "🙏",
    },
];

/// Prompts offered while a session is still empty.
pub const STARTER_QUESTIONS: &[&str] = &[
    "Tell me about Saint Yared's life",
    "What are the seven sacraments?",
    "Explain the fast of Filseta",
    "What is the history of Axum?",
];

pub fn find_category(id: &str) -> Option<&'static Category> {
    CATEGORIES
        .iter()
        .find(|category| category.id.eq_ignore_ascii_case(id.trim()))
}

/// Question sent when a category is picked from the sidebar.
pub fn category_question(label: &str) -> String {
    format!("Tell me about {label} in the Ethiopian Orthodox Tewahedo Church.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_ids_are_unique() {
        let mut ids = CATEGORIES.iter().map(|category| category.id).collect::<Vec<_>>();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), CATEGORIES.len());
    }

    #[test]
    fn category_lookup_ignores_case_and_padding() {
        let category = find_category(" Liturgy ").expect("liturgy is listed");
        assert_eq!(category.name, "Liturgy & Zema");
        assert!(find_category("astrology").is_none());
    }

    #[test]
    fn category_question_embeds_label() {
        assert_eq!(
            category_question("Saints"),
            "Tell me about Saints in the Ethiopian Orthodox Tewahedo Church."
        );
    }
}
