//! 预定义回复：问候、感谢、次数查询等无需AI参与的消息。
//! 命中预定义回复的消息不消耗每日配额。

// 超过长度上限的消息不再视作简单问候或感谢
const MAX_GREETING_CHARS: usize = 6;
const MAX_THANKS_CHARS_CJK: usize = 6;
const MAX_THANKS_CHARS_ASCII: usize = 10;

const GREETING_KEYWORDS: &[&str] = &[
    "你好", "您好", "hello", "hi", "嗨", "哈喽", "早上好", "下午好", "晚上好", "晚安", "在吗",
    "在不在", "在线吗", "hey", "嘿",
];

const THANKS_KEYWORDS: &[&str] = &[
    "谢谢",
    "谢了",
    "感谢",
    "多谢",
    "谢谢你",
    "谢谢您",
    "感谢你",
    "感谢您",
    "非常感谢",
    "十分感谢",
    "thanks",
    "thank you",
    "thx",
    "ty",
    "thks",
    "谢",
    "谢啦",
    "辛苦了",
    "辛苦",
    "赞",
    "cool",
    "棒",
    "好的",
    "ok",
    "okay",
];

const STATS_QUERIES: &[&str] = &["剩余次数", "查询次数", "还有几次", "次数"];

pub const GREETING_REPLY: &str = "你好！我是悦华珍珠AI助手宝儿，可以回答你任何和珍珠相关的问题。\
关于珍珠的品种、鉴别、历史、佩戴、护理等，如果你有任何疑问，欢迎随时提问！";

pub const THANKS_REPLY: &str = "不客气！很高兴能为您解答。\
如果您以后还有任何关于珍珠的问题，随时欢迎来咨询我。祝您生活愉快！";

/// 预定义消息的匹配与应答
#[derive(Clone)]
pub struct PredefinedResponder {
    daily_limit: u32,
}

impl PredefinedResponder {
    pub fn new(daily_limit: u32) -> Self {
        Self { daily_limit }
    }

    /// 尝试以预定义回复处理消息。命中时返回回复文本。
    pub fn respond(&self, text: &str, used: u32, remaining: u32) -> Option<String> {
        if is_stats_query(text) {
            Some(self.stats_reply(used, remaining))
        } else if is_greeting(text) {
            Some(GREETING_REPLY.to_string())
        } else if is_thanks(text) {
            Some(THANKS_REPLY.to_string())
        } else {
            None
        }
    }

    /// 订阅事件的欢迎语，附带当日剩余次数
    pub fn welcome_reply(&self, remaining: u32) -> String {
        format!(
            "Hi，感谢订阅沛珠记，成为我们大家庭的一员。我是AI珍珠专家宝儿，\
你可以向我咨询任何珍珠相关问题，我会努力回答！\n\n\
💡 温馨提示：每天您有{}次对话机会，今日剩余{}次。",
            self.daily_limit, remaining
        )
    }

    fn stats_reply(&self, used: u32, remaining: u32) -> String {
        format!(
            "📊 今日对话统计：\n已使用：{used}次\n剩余：{remaining}次\n总计：{}次/天",
            self.daily_limit
        )
    }
}

fn is_greeting(text: &str) -> bool {
    let cleaned = text.trim().to_lowercase();
    if cleaned.is_empty() || cleaned.chars().count() > MAX_GREETING_CHARS {
        return false;
    }
    GREETING_KEYWORDS.iter().any(|k| cleaned.contains(k))
}

fn is_thanks(text: &str) -> bool {
    let cleaned = text.trim().to_lowercase();
    if cleaned.is_empty() {
        return false;
    }
    let has_cjk = cleaned.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c));
    let max_chars = if has_cjk {
        MAX_THANKS_CHARS_CJK
    } else {
        MAX_THANKS_CHARS_ASCII
    };
    if cleaned.chars().count() > max_chars {
        return false;
    }
    THANKS_KEYWORDS.iter().any(|k| cleaned.contains(k))
}

fn is_stats_query(text: &str) -> bool {
    STATS_QUERIES.contains(&text.trim().to_lowercase().as_str())
}
