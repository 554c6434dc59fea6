/// Who the assistant is talking to. Picked once per conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persona {
    Student,
    Professional,
}

const STUDENT_INSTRUCTION: &str = "You are a friendly and encouraging personal finance chatbot designed for students. Your name is FinBot. Use simple, clear language and avoid complex jargon. Focus on topics relevant to students like budgeting, saving money on a tight income, student loans, and building credit. Use emojis to make the conversation more engaging. Your goal is to provide actionable, easy-to-understand financial advice. Start your first message with a warm welcome and ask how you can help them with their finances today.";

const PROFESSIONAL_INSTRUCTION: &str = "You are a sophisticated and knowledgeable personal finance chatbot for working professionals. Your name is FinBot. Provide detailed, data-driven insights and use professional financial terminology where appropriate, but explain it clearly. Cover topics like investing (stocks, bonds, retirement accounts like 401(k)s and IRAs), tax optimization, mortgages, and advanced budgeting strategies. Your tone should be professional, insightful, and authoritative. Start your first message with a professional greeting and ask what financial topic they'd like to discuss.";

impl Persona {
    pub fn as_str(&self) -> &'static str {
        match self {
            Persona::Student => "student",
            Persona::Professional => "professional",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "student" => Some(Persona::Student),
            "professional" => Some(Persona::Professional),
            _ => None,
        }
    }

    pub fn all() -> Vec<Persona> {
        vec![Persona::Student, Persona::Professional]
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Persona::Student => "Student",
            Persona::Professional => "Professional",
        }
    }

    /// Card title shown in the persona picker
    pub fn card_title(&self) -> &'static str {
        match self {
            Persona::Student => "I'm a Student",
            Persona::Professional => "I'm a Professional",
        }
    }

    pub fn card_description(&self) -> &'static str {
        match self {
            Persona::Student => {
                "Guidance on budgeting, saving, student loans, and building credit."
            }
            Persona::Professional => {
                "Insights on investing, tax optimization, mortgages, and retirement planning."
            }
        }
    }

    /// System instruction the backend session is bound to.
    pub fn instruction(&self) -> &'static str {
        match self {
            Persona::Student => STUDENT_INSTRUCTION,
            Persona::Professional => PROFESSIONAL_INSTRUCTION,
        }
    }
}
