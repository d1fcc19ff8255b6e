//! Minimal login page. The real frontend is an external collaborator; this
//! form only needs to set the session cookie.

pub fn render(csrf_token: &str, error: &str) -> String {
    let error_block = if error.is_empty() {
        String::new()
    } else {
        format!(r#"<p class="error">{error}</p>"#)
    };

    format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Superposition</title>
<style>
  body {{ font-family: system-ui, sans-serif; background: #111; color: #eee;
         display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0; }}
  form {{ background: #1c1c1c; padding: 2rem; border-radius: 8px; min-width: 280px; }}
  h1 {{ font-size: 1.2rem; margin-top: 0; }}
  input {{ display: block; width: 100%; box-sizing: border-box; margin: .5rem 0 1rem;
           padding: .5rem; border: 1px solid #333; border-radius: 4px; background: #111; color: #eee; }}
  button {{ width: 100%; padding: .6rem; border: 0; border-radius: 4px;
            background: #4a7dff; color: #fff; cursor: pointer; }}
  .error {{ color: #ff6b6b; }}
</style>
</head>
<body>
<form method="post" action="/auth/login">
  <h1>Superposition</h1>
  {error_block}
  <label for="username">Username</label>
  <input id="username" name="username" autocomplete="username" required>
  <label for="password">Password</label>
  <input id="password" name="password" type="password" autocomplete="current-password" required>
  <input type="hidden" name="csrf_token" value="{csrf_token}">
  <button type="submit">Sign in</button>
</form>
</body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_embeds_csrf_token_and_error() {
        let page = render("tok123", "");
        assert!(page.contains(r#"value="tok123""#));
        assert!(!page.contains("class=\"error\""));

        let page = render("tok123", "Invalid username or password");
        assert!(page.contains("Invalid username or password"));
    }
}
