pub mod html_text;
