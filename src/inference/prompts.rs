//! Fixed prompt templates for the two inference stages.
//!
//! The deployment language is Japanese. The vision stage asks for a
//! machine-parseable JSON breakdown; the generation stage turns the
//! structured result into prose for the user.

/// Vision-stage instruction sent alongside the inline image data.
///
/// The response must be a bare JSON object so the client's structured
/// parse has a stable shape to work with.
pub const VISION_PROMPT: &str = r#"この写真に写っている食材・料理名・調理法・分量を推定してください。
結果は次の形式のJSONのみで出力してください（説明文は不要）:
{
  "items": [{"name": "献立名", "calories": 推定カロリー(数値)}],
  "total": 献立全体の合算カロリー(数値),
  "cooking_method": "調理法の推定"
}"#;

/// Generation-stage prompt wrapping the serialized stage-one result.
///
/// Requests the fixed breakdown: per-item name and calories, the aggregate
/// total, and a cooking-method estimate.
pub fn build_explain_prompt(analysis_json: &str) -> String {
    format!(
        "画像から分析した食事内容に基づいて、以下のような情報を生成してください：\n\
         1. 各料理の名前と推定カロリー\n\
         2. 献立全体の合算カロリー\n\
         3. 調理法の推定\n\n\
         分析結果：{}",
        analysis_json
    )
}
