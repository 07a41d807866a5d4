//! プロンプト生成モジュール
//!
//! Vision API へ送る学習状況判定プロンプト。
//! 出力キーは既定ルール（config::default_rules）のキーと一致させること。

/// 判定属性（キー, 説明）
pub const SCENE_ATTRIBUTES: &[(&str, &str)] = &[
    ("at_desk", "true/false, #孩子是否坐在书桌前"),
    ("is_study", "true/false, #是否在学习"),
    ("activity", "\"看书/写字/用电脑/玩手机/发呆/其他\""),
    (
        "posture",
        "\"端正/不佳/趴着/歪坐/其他\", #请特别关注学生的【下肢和脚部姿势】，判断是否存在不规范坐姿，例如：脚踩在椅子上、双腿蜷缩在椅面、盘腿坐在椅子上等。",
    ),
    ("lighting", "\"充足/一般/昏暗\""),
    ("overall_status", "\"当前学习状态的完整描述（20-100字）\""),
];

/// 画像判定プロンプト生成
///
/// # Returns
/// JSONオブジェクトのみを返すよう指示したプロンプト文字列
pub fn build_vision_prompt() -> String {
    let fields = SCENE_ATTRIBUTES
        .iter()
        .map(|(key, desc)| format!("  \"{}\": {}", key, desc))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"你是学习监督助手，分析图片中孩子的学习状态。

返回JSON格式：
{{
{fields}
}}

只返回纯JSON，无其他内容。"#
    )
}

/// 接続確認用の最小プロンプト
pub const CONNECTION_CHECK_PROMPT: &str = "Hello";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_vision_prompt_lists_every_attribute() {
        let prompt = build_vision_prompt();
        for (key, _) in SCENE_ATTRIBUTES {
            assert!(prompt.contains(&format!("\"{}\"", key)), "missing {}", key);
        }
        assert!(prompt.contains("只返回纯JSON"));
    }

    #[test]
    fn test_prompt_braces_are_balanced() {
        let prompt = build_vision_prompt();
        let open = prompt.matches('{').count();
        let close = prompt.matches('}').count();
        assert_eq!(open, close);
    }
}
