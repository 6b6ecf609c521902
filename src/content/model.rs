use serde::Deserialize;

/// `GET /recipe/{id}` response; only the fields the notification needs.
#[derive(Deserialize, Debug)]
pub struct RecipeResponse {
    pub info: RecipeInfo,
}

#[derive(Deserialize, Debug)]
pub struct RecipeInfo {
    pub recipe: Recipe,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipe {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub about: String,
    #[serde(default)]
    pub author: Option<Author>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub login: String,
}
