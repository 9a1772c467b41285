//! Classification of response text into a [`SignState`].

use crate::outcome::SignState;
use crate::work::{FailMatcher, SuccessMatcher};
use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub state: SignState,
    pub message: String,
}

impl Classification {
    fn unknown() -> Self {
        Self {
            state: SignState::Unknown,
            message: String::new(),
        }
    }
}

static MARKUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<.*?>|&shy;|&nbsp;").expect("markup pattern is valid"));

static OUTAGES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("DDoS protection by Cloudflare", r"DDoS protection by .+?Cloudflare"),
        (
            "Server load too high",
            r"<h3 align=center>(服务器负载过|伺服器負載過)高，正在重(试|試)，(请|請)稍(后|後)\.\.\.</h3>",
        ),
        (
            "Connection timed out",
            r#"<h2 class="text-gray-600 leading-1\.3 text-3xl font-light">Connection timed out</h2>"#,
        ),
        ("Bad gateway", r"<p>The web server reported a bad gateway error\.</p>"),
        (
            "Web server is down",
            r"站点关闭维护中，请稍后再访问...谢谢|站點關閉維護中，請稍後再訪問...謝謝|Web server is down",
        ),
        ("Incorrect CSRF token", r"Incorrect CSRF token"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("outage pattern is valid")))
    .collect()
});

/// Classifies `text`: success matchers in order (first hit wins), then the
/// fail matcher, otherwise `Unknown`.
pub fn classify(text: &str, success: &[SuccessMatcher], fail: Option<&FailMatcher>) -> Classification {
    for matcher in success {
        if let Some(message) = matcher.extract(text) {
            return Classification {
                state: matcher.signals(),
                message: clean_message(&message),
            };
        }
    }

    if let Some(fail) = fail {
        if let Some(message) = fail.extract(text) {
            return Classification {
                state: fail.signals(),
                message,
            };
        }
    }

    Classification::unknown()
}

/// Name of the well-known outage or anti-bot page `text` is, if any.
pub fn detect_outage(text: &str) -> Option<&'static str> {
    OUTAGES
        .iter()
        .find(|(_, pattern)| pattern.is_match(text))
        .map(|(name, _)| *name)
}

fn clean_message(message: &str) -> String {
    MARKUP.replace_all(message, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(p: &str) -> SuccessMatcher {
        SuccessMatcher::plain(p).unwrap()
    }

    #[test]
    fn first_matching_success_matcher_wins() {
        let matchers = vec![
            plain("签到成功").signalling(SignState::Succeeded),
            plain("今天已签到").already_done(),
        ];
        let text = "今天已签到 ... 签到成功";
        let c = classify(text, &matchers, None);
        assert_eq!(c.state, SignState::Succeeded);
        assert_eq!(c.message, "签到成功");

        let reversed: Vec<_> = matchers.into_iter().rev().collect();
        let c = classify(text, &reversed, None);
        assert_eq!(c.state, SignState::AlreadyDone);
        assert_eq!(c.message, "今天已签到");
    }

    #[test]
    fn capture_group_becomes_message() {
        let matchers = vec![SuccessMatcher::capturing(r"获得(\d+)魔力值", 1).unwrap()];
        let c = classify("本次签到获得10魔力值", &matchers, None);
        assert_eq!(c, Classification { state: SignState::Succeeded, message: "10".into() });
    }

    #[test]
    fn fail_matcher_applies_when_no_success_matches() {
        let matchers = vec![plain("签到成功")];
        let fail = FailMatcher::new("验证码错误|请求过于频繁").unwrap();
        let c = classify("<p>验证码错误</p>", &matchers, Some(&fail));
        assert_eq!(c.state, SignState::Failed);
        assert_eq!(c.message, "验证码错误");

        let wrong = FailMatcher::new("回答错误").unwrap().wrong_answer();
        let c = classify("回答错误，再接再厉", &matchers, Some(&wrong));
        assert_eq!(c.state, SignState::WrongAnswer);
    }

    #[test]
    fn success_takes_precedence_over_fail() {
        let matchers = vec![plain("签到成功")];
        let fail = FailMatcher::new("错误").unwrap();
        let c = classify("签到成功 (上次验证码错误)", &matchers, Some(&fail));
        assert_eq!(c.state, SignState::Succeeded);
    }

    #[test]
    fn nothing_matching_is_unknown() {
        let c = classify("<html>login</html>", &[plain("签到成功")], None);
        assert_eq!(c, Classification::unknown());
    }

    #[test]
    fn empty_matchers_leave_text_unknown() {
        assert_eq!(classify("anything", &[], None).state, SignState::Unknown);
        let fail = FailMatcher::new("403 Forbidden").unwrap();
        assert_eq!(classify("403 Forbidden", &[], Some(&fail)).state, SignState::Failed);
    }

    #[test]
    fn success_message_is_stripped_of_markup() {
        let matchers = vec![plain(r"这是您的第.*?次签到")];
        let c = classify("这是您的第<b>12</b>&nbsp;次签到", &matchers, None);
        assert_eq!(c.message, "这是您的第12次签到");
    }

    #[test]
    fn matching_is_case_sensitive() {
        let c = classify("SIGNED IN", &[plain("signed in")], None);
        assert_eq!(c.state, SignState::Unknown);
    }

    #[test]
    fn recognises_outage_pages() {
        assert_eq!(
            detect_outage("<h3 align=center>服务器负载过高，正在重试，请稍后...</h3>"),
            Some("Server load too high")
        );
        assert_eq!(detect_outage("Incorrect CSRF token."), Some("Incorrect CSRF token"));
        assert_eq!(detect_outage("<html>normal page</html>"), None);
    }
}
